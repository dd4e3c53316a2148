//! References to values living on the interpreter heap.

use std::ffi::CString;
use std::fmt::{self, Debug, Display, Formatter};
use std::marker::PhantomData;
use std::os::raw::c_int;
use std::rc::{Rc, Weak};
use std::slice;
use std::str;

use crate::stack::{self, RawState, StackValue};
use crate::sys;
use crate::value::Value;
use crate::{Error, Lua};

/// Reference to a value held by a lua instance.
///
/// The referenced value is pinned through the interpreter's registry and
/// released again when the last clone of the `Ref` drops. The reference
/// only weakly ties to the owning instance; operations on a reference that
/// outlived its instance degrade gracefully instead of touching freed
/// state.
pub struct Ref<T> {
    pub(crate) slot: c_int,
    pub(crate) state: Weak<RawState>,
    _marker: PhantomData<T>,
}

impl<T> Ref<T> {
    /// Pops the value on top of the stack into a new registry reference.
    pub(crate) unsafe fn register(state: &Rc<RawState>) -> Ref<T> {
        let slot = sys::luaL_ref(state.ptr, sys::LUA_REGISTRYINDEX);
        Ref {
            slot,
            state: Rc::downgrade(&RawState::root(state.clone())),
            _marker: PhantomData,
        }
    }

    /// Pushes the referenced value back onto the stack.
    pub(crate) unsafe fn push_slot(&self, state: &Rc<RawState>) {
        sys::lua_rawgeti(state.ptr, sys::LUA_REGISTRYINDEX, self.slot);
    }

    pub(crate) fn upgrade(&self) -> Option<Rc<RawState>> {
        self.state.upgrade()
    }
}

impl<T> Clone for Ref<T> {
    fn clone(&self) -> Self {
        let state = self
            .upgrade()
            .expect("cloning a reference into a shut down lua instance");
        unsafe {
            self.push_slot(&state);
            let slot = sys::luaL_ref(state.ptr, sys::LUA_REGISTRYINDEX);
            Ref {
                slot,
                state: self.state.clone(),
                _marker: PhantomData,
            }
        }
    }
}

impl<T> Drop for Ref<T> {
    #[inline]
    fn drop(&mut self) {
        if let Some(state) = self.state.upgrade() {
            unsafe {
                sys::luaL_unref(state.ptr, sys::LUA_REGISTRYINDEX, self.slot);
            }
        }
    }
}

impl<T> PartialEq for Ref<T> {
    fn eq(&self, other: &Self) -> bool {
        let state = match self.upgrade() {
            Some(state) => state,
            None => return false,
        };
        unsafe {
            self.push_slot(&state);
            other.push_slot(&state);
            let ret = sys::lua_rawequal(state.ptr, -1, -2);
            sys::lua_pop(state.ptr, 2);
            ret != 0
        }
    }
}

// Dynamically typed references

/// Any lua type.
pub enum Unknown {}

impl<T> Ref<T> {
    /// Discards the type information of this reference.
    pub fn into_unknown(mut self) -> Ref<Unknown> {
        use std::mem;
        let r = Ref {
            slot: self.slot,
            state: mem::replace(&mut self.state, Weak::new()),
            _marker: PhantomData,
        };
        // The registry slot moves over as-is; the old reference must not
        // release it.
        mem::forget(self);
        r
    }
}

impl Ref<Unknown> {
    /// Creates a reference to a nil value.
    pub fn new_nil(lua: &Lua) -> Ref<Unknown> {
        unsafe {
            let state = RawState::root(lua.state.clone());
            sys::lua_pushnil(state.ptr);
            Ref::register(&state)
        }
    }

    /// Creates a reference to any lua value.
    pub fn new_unknown<V>(lua: &Lua, v: V) -> Ref<Unknown>
    where
        V: Value,
    {
        unsafe {
            let state = RawState::root(lua.state.clone());
            v.push(&state)
                .expect("failed to push value on to the lua stack");
            Ref::register(&state)
        }
    }

    /// Returns whether this value is nil.
    pub fn is_nil(&self) -> bool {
        let state = match self.upgrade() {
            Some(state) => state,
            None => return false,
        };
        unsafe {
            self.push_slot(&state);
            let ret = sys::lua_type(state.ptr, -1) == sys::LUA_TNIL;
            sys::lua_pop(state.ptr, 1);
            ret
        }
    }

    /// Tries to convert the value into the target type.
    pub fn try_convert<T: Value>(&self) -> Result<T, Error> {
        let state = self.upgrade().ok_or(Error::Shutdown)?;
        unsafe {
            self.push_slot(&state);
            let val = T::read(&state, -T::slots());
            sys::lua_pop(state.ptr, T::slots());
            val
        }
    }
}

impl Value for Ref<Unknown> {}
unsafe impl StackValue for Ref<Unknown> {
    unsafe fn read(state: &Rc<RawState>, idx: c_int) -> Result<Self, Error> {
        sys::lua_pushvalue(state.ptr, idx);
        Ok(Ref::register(state))
    }

    fn slots() -> c_int {
        1
    }

    unsafe fn push(self, state: &Rc<RawState>) -> Result<(), Error> {
        self.push_slot(state);
        Ok(())
    }
}

// Strings

impl Ref<String> {
    /// Places the passed bytes onto the lua heap as a string and returns a
    /// reference to it. Embedded NUL bytes are preserved.
    #[inline]
    pub fn new_string<S: AsRef<[u8]>>(lua: &Lua, s: S) -> Ref<String> {
        let bytes = s.as_ref();
        unsafe {
            let state = RawState::root(lua.state.clone());
            sys::lua_pushlstring(state.ptr, bytes.as_ptr() as *const _, bytes.len());
            Ref::register(&state)
        }
    }
}

impl Value for Ref<String> {}
unsafe impl StackValue for Ref<String> {
    unsafe fn read(state: &Rc<RawState>, idx: c_int) -> Result<Self, Error> {
        if sys::lua_isstring(state.ptr, idx) != 0 {
            sys::lua_pushvalue(state.ptr, idx);
            Ok(Ref::register(state))
        } else {
            Err(Error::TypeMismatch { wanted: "String" })
        }
    }

    fn slots() -> c_int {
        1
    }

    unsafe fn push(self, state: &Rc<RawState>) -> Result<(), Error> {
        self.push_slot(state);
        Ok(())
    }
}

impl std::ops::Deref for Ref<String> {
    type Target = str;
    fn deref(&self) -> &str {
        let state = match self.upgrade() {
            Some(state) => state,
            None => return "",
        };
        unsafe {
            self.push_slot(&state);
            let mut len = 0usize;
            let data = sys::lua_tolstring(state.ptr, -1, &mut len);
            sys::lua_pop(state.ptr, 1);
            if data.is_null() {
                return "";
            }
            // The string object stays pinned by the registry reference, so
            // the pointer outlives this call.
            let bytes = slice::from_raw_parts(data as *const u8, len);
            str::from_utf8(bytes).unwrap_or("")
        }
    }
}

impl Display for Ref<String> {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        Display::fmt(&**self, f)
    }
}

impl Debug for Ref<String> {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        Debug::fmt(&**self, f)
    }
}

// Tables

/// A lua table.
///
/// Values of this type are created by `Ref::new_table`.
pub enum Table {}

impl Ref<Table> {
    /// Creates an empty table on the lua heap.
    #[inline]
    pub fn new_table(lua: &Lua) -> Ref<Table> {
        unsafe {
            let state = RawState::root(lua.state.clone());
            sys::lua_createtable(state.ptr, 0, 0);
            Ref::register(&state)
        }
    }

    /// Inserts the passed value into the table with the given key.
    #[inline]
    pub fn insert<K, V>(&self, k: K, v: V)
    where
        K: Value,
        V: Value,
    {
        let state = match self.upgrade() {
            Some(state) => state,
            None => return,
        };
        unsafe {
            self.push_slot(&state);
            k.push(&state).unwrap();
            v.push(&state).unwrap();
            sys::lua_rawset(state.ptr, -3);
            sys::lua_pop(state.ptr, 1);
        }
    }

    /// Gets the value with the given key from the table.
    ///
    /// Returns `None` if the value doesn't exist or can't be converted
    /// into the requested type.
    #[inline]
    pub fn get<K, V>(&self, k: K) -> Option<V>
    where
        K: Value,
        V: Value,
    {
        let state = self.upgrade()?;
        unsafe {
            self.push_slot(&state);
            k.push(&state).unwrap();
            sys::lua_rawget(state.ptr, -2);
            let val = V::read(&state, -1);
            sys::lua_pop(state.ptr, 2);
            val.ok()
        }
    }

    /// Returns the 'length' of this table, as lua's `#` operator would.
    ///
    /// Only meaningful when the table is structured as an array.
    pub fn length(&self) -> i32 {
        let state = match self.upgrade() {
            Some(state) => state,
            None => return 0,
        };
        unsafe {
            self.push_slot(&state);
            let len = sys::lua_objlen(state.ptr, -1);
            sys::lua_pop(state.ptr, 1);
            len as i32
        }
    }

    /// Returns an iterator over the table's entries.
    ///
    /// Entries that fail to convert to `(K, V)` are skipped.
    pub fn iter<K, V>(&self) -> TableIterator<K, V>
    where
        K: Value,
        V: Value,
    {
        let state = self
            .upgrade()
            .expect("iterating a table of a shut down lua instance");
        unsafe {
            self.push_slot(&state);
            sys::lua_pushnil(state.ptr);
        }
        TableIterator {
            state,
            ended: false,
            _k: PhantomData,
            _v: PhantomData,
        }
    }
}

impl Value for Ref<Table> {}
unsafe impl StackValue for Ref<Table> {
    unsafe fn read(state: &Rc<RawState>, idx: c_int) -> Result<Self, Error> {
        if sys::lua_type(state.ptr, idx) == sys::LUA_TTABLE {
            sys::lua_pushvalue(state.ptr, idx);
            Ok(Ref::register(state))
        } else {
            Err(Error::TypeMismatch { wanted: "Table" })
        }
    }

    fn slots() -> c_int {
        1
    }

    unsafe fn push(self, state: &Rc<RawState>) -> Result<(), Error> {
        self.push_slot(state);
        Ok(())
    }
}

pub struct TableIterator<K, V>
where
    K: Value,
    V: Value,
{
    state: Rc<RawState>,
    ended: bool,
    _k: PhantomData<K>,
    _v: PhantomData<V>,
}

impl<K, V> Iterator for TableIterator<K, V>
where
    K: Value,
    V: Value,
{
    type Item = (K, V);
    fn next(&mut self) -> Option<(K, V)> {
        if self.ended {
            return None;
        }
        unsafe {
            loop {
                if sys::lua_next(self.state.ptr, -2) != 0 {
                    let key = K::read(&self.state, -2);
                    let val = V::read(&self.state, -1);
                    sys::lua_pop(self.state.ptr, 1);
                    if let (Ok(key), Ok(val)) = (key, val) {
                        return Some((key, val));
                    }
                } else {
                    sys::lua_pop(self.state.ptr, 1);
                    self.ended = true;
                    return None;
                }
            }
        }
    }
}

impl<K, V> Drop for TableIterator<K, V>
where
    K: Value,
    V: Value,
{
    fn drop(&mut self) {
        if !self.ended {
            unsafe {
                // The table (and a pending key) are still on the stack.
                sys::lua_pop(self.state.ptr, 1);
            }
        }
    }
}

// Coroutines

/// A lua coroutine.
pub enum Coroutine {}

impl Value for Ref<Coroutine> {}
unsafe impl StackValue for Ref<Coroutine> {
    unsafe fn read(state: &Rc<RawState>, idx: c_int) -> Result<Self, Error> {
        if sys::lua_type(state.ptr, idx) == sys::LUA_TTHREAD {
            sys::lua_pushvalue(state.ptr, idx);
            Ok(Ref::register(state))
        } else {
            Err(Error::TypeMismatch {
                wanted: "Coroutine",
            })
        }
    }

    fn slots() -> c_int {
        1
    }

    unsafe fn push(self, state: &Rc<RawState>) -> Result<(), Error> {
        self.push_slot(state);
        Ok(())
    }
}

// Functions

/// A lua function.
///
/// Values of this type are created by `Ref::new_function`.
pub enum Function {}

impl Ref<Function> {
    /// Compiles the given lua source into a function.
    pub fn new_function(lua: &Lua, source: &str) -> Result<Ref<Function>, Error> {
        let c_script = CString::new(source).unwrap();
        let c_name = CString::new("<inline function>").unwrap();
        unsafe {
            let state = RawState::root(lua.state.clone());
            let status = sys::luaL_loadbuffer(
                state.ptr,
                c_script.as_ptr(),
                source.len(),
                c_name.as_ptr(),
            );
            if status != 0 {
                return Err(stack::take_error(&state));
            }
            Ok(Ref::register(&state))
        }
    }

    /// Invokes the referenced function, passing the parameters and
    /// converting the result to the requested type.
    pub fn invoke<P: Value, Ret: Value>(&self, param: P) -> Result<Ret, Error> {
        let state = self.upgrade().ok_or(Error::Shutdown)?;
        unsafe {
            // Used to validate the stack after use
            #[cfg(debug_assertions)]
            let orig_top = sys::lua_gettop(state.ptr);

            self.push_slot(&state);
            param.push(&state)?;
            let res = sys::lua_pcall(state.ptr, P::slots(), Ret::slots(), 0);
            if res != 0 {
                return Err(stack::take_error(&state));
            }
            let ret = Ret::read(&state, -Ret::slots());
            sys::lua_pop(state.ptr, Ret::slots());

            #[cfg(debug_assertions)]
            debug_assert_eq!(orig_top, sys::lua_gettop(state.ptr));
            ret
        }
    }
}

impl Value for Ref<Function> {}
unsafe impl StackValue for Ref<Function> {
    unsafe fn read(state: &Rc<RawState>, idx: c_int) -> Result<Self, Error> {
        if sys::lua_type(state.ptr, idx) == sys::LUA_TFUNCTION {
            sys::lua_pushvalue(state.ptr, idx);
            Ok(Ref::register(state))
        } else {
            Err(Error::TypeMismatch { wanted: "Function" })
        }
    }

    fn slots() -> c_int {
        1
    }

    unsafe fn push(self, state: &Rc<RawState>) -> Result<(), Error> {
        self.push_slot(state);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Scope;

    #[test]
    fn string_round_trip() {
        let lua = Lua::new();
        let s = Ref::new_string(&lua, "hello world");
        assert_eq!(&*s, "hello world");
        lua.set(Scope::Global, "greeting", s);
        lua.execute_string::<()>(r#"assert(greeting == "hello world")"#)
            .unwrap();
    }

    #[test]
    fn table_insert_get_length() {
        let lua = Lua::new();
        let tbl = Ref::new_table(&lua);
        tbl.insert(Ref::new_string(&lua, "answer"), 42);
        assert_eq!(tbl.get::<_, i32>(Ref::new_string(&lua, "answer")), Some(42));
        assert_eq!(tbl.get::<_, i32>(Ref::new_string(&lua, "missing")), None);

        let arr: Ref<Table> = lua.execute_string("return {10, 20, 30}").unwrap();
        assert_eq!(arr.length(), 3);
    }

    #[test]
    fn table_iteration() {
        let lua = Lua::new();
        let arr: Ref<Table> = lua.execute_string("return {4, 5, 6}").unwrap();
        let mut values: Vec<(i32, i32)> = arr.iter().collect();
        values.sort();
        assert_eq!(values, vec![(1, 4), (2, 5), (3, 6)]);
    }

    #[test]
    fn function_compile_and_invoke() {
        let lua = Lua::new();
        let func = Ref::new_function(&lua, "return 67").unwrap();
        assert_eq!(func.invoke::<(), i32>(()).unwrap(), 67);

        assert!(Ref::new_function(&lua, "return ((").is_err());
    }

    #[test]
    fn function_returned_from_script() {
        let lua = Lua::new();
        let func = lua
            .execute_string::<Ref<Function>>(
                r#"
        return function(a)
            return function(b)
                return a * b
            end
        end
        "#,
            )
            .unwrap();

        let mul = func.invoke::<i32, Ref<Function>>(6).unwrap();
        assert_eq!(mul.invoke::<i32, i32>(7).unwrap(), 6 * 7);
    }

    #[test]
    fn ref_equality() {
        let lua = Lua::new();
        let a: Ref<Table> = lua.execute_string("t = {}; return t").unwrap();
        let b: Ref<Table> = lua.execute_string("return t").unwrap();
        let c: Ref<Table> = lua.execute_string("return {}").unwrap();
        assert!(a == b);
        assert!(a != c);
        assert!(a.clone() == b);
    }

    #[test]
    fn unknown_refs() {
        let lua = Lua::new();
        let nil = Ref::new_nil(&lua);
        assert!(nil.is_nil());

        let val = Ref::new_unknown(&lua, 5.5);
        assert!(!val.is_nil());
        assert_eq!(val.try_convert::<f64>(), Ok(5.5));
        assert!(matches!(
            val.try_convert::<Ref<Table>>(),
            Err(Error::TypeMismatch { wanted: "Table" })
        ));
    }
}
