//! Scoped lending of host references into lua.
//!
//! Borrowed references are only valid for the duration of one call into
//! the interpreter; the table tracking them lives in the registry and is
//! cleared when the [`BorrowBuilder`] drops.

use std::any::{Any, TypeId};
use std::cell::{Cell, RefCell};
use std::ops::{Deref, DerefMut};

use ahash::AHashMap;

use crate::stack::{self, StackValue};
use crate::sys;
use crate::value::Value;
use crate::{Error, Lua};

/// Registry key of the per-state borrow table.
pub(crate) const BORROW_TABLE_KEY: &[u8] = b"luahost_borrows\0";

pub(crate) type BorrowTable = RefCell<AHashMap<TypeId, Borrow>>;

pub(crate) enum Borrow {
    Immutable(ImmutableBorrow),
    Mutable(MutableBorrow),
    Empty,
}

enum AnyType {}

pub(crate) struct ImmutableBorrow {
    ptr: *const AnyType,
}

pub(crate) struct MutableBorrow {
    ptr: *mut AnyType,
    state: Cell<BorrowState>,
}

#[derive(Clone, Copy)]
enum BorrowState {
    None,
    Read(usize),
    Write,
}

unsafe fn borrow_table(lua: &Lua) -> *mut BorrowTable {
    stack::registry_ptr::<BorrowTable>(lua.state.ptr, BORROW_TABLE_KEY)
}

impl Lua {
    /// Starts building a list of borrowed values that will be accessible
    /// during the execution of the function called at the end.
    pub fn with_borrows(&self) -> BorrowBuilder {
        BorrowBuilder { lua: self }
    }

    /// Get an immutable reference to a value borrowed via
    /// `BorrowBuilder::borrow`.
    ///
    /// # Panics
    ///
    /// Panics if the value wasn't borrowed.
    pub fn get_borrow<T: Any>(&self) -> &T {
        let ty = TypeId::of::<T>();
        unsafe {
            let table = (*borrow_table(self)).borrow();
            if let Some(&Borrow::Immutable(ref val)) = table.get(&ty) {
                &*(val.ptr as *const T)
            } else {
                panic!("value not borrowed")
            }
        }
    }

    /// Get an immutable reference to a mutably borrowed value that was
    /// borrowed via `BorrowBuilder::borrow_mut`.
    ///
    /// # Panics
    ///
    /// Panics if the value wasn't borrowed or is currently borrowed
    /// mutably.
    pub fn read_borrow<T: Any>(&self) -> BorrowRef<T> {
        let ty = TypeId::of::<T>();
        unsafe {
            let mut table = (*borrow_table(self)).borrow_mut();
            if let Some(&mut Borrow::Mutable(ref mut val)) = table.get_mut(&ty) {
                match val.state.get() {
                    BorrowState::None => val.state.set(BorrowState::Read(1)),
                    BorrowState::Read(count) => val.state.set(BorrowState::Read(count + 1)),
                    BorrowState::Write => {
                        panic!("can't borrow value immutably that is borrowed mutably")
                    }
                }
                BorrowRef {
                    value: &*(val.ptr as *mut T),
                    state: &*(&val.state as *const Cell<BorrowState>),
                }
            } else {
                panic!("value not borrowed")
            }
        }
    }

    /// Get a mutable reference to a mutably borrowed value that was
    /// borrowed via `BorrowBuilder::borrow_mut`.
    ///
    /// # Panics
    ///
    /// Panics if the value wasn't borrowed or is currently borrowed in
    /// any way.
    pub fn write_borrow<T: Any>(&self) -> BorrowRefMut<T> {
        let ty = TypeId::of::<T>();
        unsafe {
            let mut table = (*borrow_table(self)).borrow_mut();
            if let Some(&mut Borrow::Mutable(ref mut val)) = table.get_mut(&ty) {
                match val.state.get() {
                    BorrowState::None => val.state.set(BorrowState::Write),
                    BorrowState::Read(_) => {
                        panic!("can't borrow value mutably that is borrowed immutably")
                    }
                    BorrowState::Write => {
                        panic!("can't borrow value mutably that is borrowed already mutably")
                    }
                }
                BorrowRefMut {
                    value: &mut *(val.ptr as *mut T),
                    state: &*(&val.state as *const Cell<BorrowState>),
                }
            } else {
                panic!("value not borrowed")
            }
        }
    }
}

/// A read guard over a mutably borrowed value. Tracks when it falls out
/// of use.
pub struct BorrowRef<'a, T: 'a + ?Sized> {
    value: &'a T,
    state: &'a Cell<BorrowState>,
}

impl<'a, T: 'a> BorrowRef<'a, T>
where
    T: ?Sized,
{
    pub fn map<F, R>(this: BorrowRef<'a, T>, mfunc: F) -> BorrowRef<'a, R>
    where
        F: FnOnce(&'a T) -> &'a R,
        R: ?Sized,
    {
        use std::mem;
        let state = this.state;
        let val = this.value;
        // Don't run drop; the new guard takes over the read count.
        mem::forget(this);
        BorrowRef {
            value: mfunc(val),
            state,
        }
    }
}

impl<'a, T> Deref for BorrowRef<'a, T>
where
    T: ?Sized,
{
    type Target = T;
    fn deref(&self) -> &T {
        self.value
    }
}

impl<'a, T> Drop for BorrowRef<'a, T>
where
    T: ?Sized,
{
    fn drop(&mut self) {
        if let BorrowState::Read(mut count) = self.state.get() {
            count -= 1;
            if count == 0 {
                self.state.set(BorrowState::None);
            } else {
                self.state.set(BorrowState::Read(count));
            }
        } else {
            panic!("invalid borrow state");
        }
    }
}

/// A write guard over a mutably borrowed value.
pub struct BorrowRefMut<'a, T: 'a> {
    value: &'a mut T,
    state: &'a Cell<BorrowState>,
}

impl<'a, T> Deref for BorrowRefMut<'a, T> {
    type Target = T;
    fn deref(&self) -> &T {
        self.value
    }
}

impl<'a, T> DerefMut for BorrowRefMut<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        self.value
    }
}

impl<'a, T> Drop for BorrowRefMut<'a, T> {
    fn drop(&mut self) {
        if let BorrowState::Write = self.state.get() {
            self.state.set(BorrowState::None);
        } else {
            panic!("invalid borrow state");
        }
    }
}

/// Used to pass references into lua for the duration of one function
/// call.
///
/// Created by `Lua::with_borrows`.
pub struct BorrowBuilder<'a> {
    lua: &'a Lua,
}

impl<'a> BorrowBuilder<'a> {
    /// Borrows an immutable reference and makes it accessible to lua for
    /// the duration of the call.
    pub fn borrow<T>(self, val: &'a T) -> Self
    where
        T: Any,
    {
        unsafe {
            (*borrow_table(self.lua)).borrow_mut().insert(
                TypeId::of::<T>(),
                Borrow::Immutable(ImmutableBorrow {
                    ptr: val as *const T as *const _,
                }),
            );
        }
        self
    }

    /// Borrows a mutable reference and makes it accessible to lua for the
    /// duration of the call.
    pub fn borrow_mut<T>(self, val: &'a mut T) -> Self
    where
        T: Any,
    {
        unsafe {
            (*borrow_table(self.lua)).borrow_mut().insert(
                TypeId::of::<T>(),
                Borrow::Mutable(MutableBorrow {
                    ptr: val as *mut T as *mut _,
                    state: Cell::new(BorrowState::None),
                }),
            );
        }
        self
    }

    /// Invokes the named function in the global scope, passing the
    /// parameters and converting the result to the requested type.
    pub fn invoke_function<P: Value, Ret: Value>(self, name: &str, param: P) -> Result<Ret, Error> {
        let state = &self.lua.state;
        let c_name = std::ffi::CString::new(name).unwrap();
        unsafe {
            // Used to validate the stack after use
            #[cfg(debug_assertions)]
            let orig_top = sys::lua_gettop(state.ptr);

            sys::lua_getfield(state.ptr, sys::LUA_GLOBALSINDEX, c_name.as_ptr());
            param.push(state)?;
            let res = sys::lua_pcall(state.ptr, P::slots(), Ret::slots(), 0);
            if res != 0 {
                return Err(stack::take_error(state));
            }
            let ret = Ret::read(state, -Ret::slots());
            sys::lua_pop(state.ptr, Ret::slots());

            #[cfg(debug_assertions)]
            debug_assert_eq!(orig_top, sys::lua_gettop(state.ptr));
            ret
        }
    }
}

impl<'a> Drop for BorrowBuilder<'a> {
    fn drop(&mut self) {
        unsafe {
            let table = borrow_table(self.lua);
            for val in (*table).borrow_mut().values_mut() {
                *val = Borrow::Empty;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::{closure, Lua, Scope};

    #[test]
    fn borrows_are_visible_inside_calls() {
        let lua = Lua::new();

        let c = 55i32;
        let mut s = String::from("hello");

        lua.set(
            Scope::Global,
            "check_borrow",
            closure(|lua: &Lua| {
                let c = lua.get_borrow::<i32>();
                assert_eq!(*c, 55);
                {
                    let s = lua.read_borrow::<String>();
                    assert_eq!(&*s, "hello");
                }
                {
                    let mut s = lua.write_borrow::<String>();
                    s.push_str(" world");
                }
            }),
        );

        lua.execute_string::<()>("function test() check_borrow() end")
            .unwrap();

        lua.with_borrows()
            .borrow(&c)
            .borrow_mut(&mut s)
            .invoke_function::<(), ()>("test", ())
            .unwrap();

        assert_eq!(c, 55);
        assert_eq!(s, "hello world");
    }

    #[test]
    fn nested_read_borrows_are_counted() {
        let lua = Lua::new();
        let mut n = 7u32;

        lua.set(
            Scope::Global,
            "reader",
            closure(|lua: &Lua| {
                let a = lua.read_borrow::<u32>();
                let b = lua.read_borrow::<u32>();
                assert_eq!(*a + *b, 14);
            }),
        );
        lua.execute_string::<()>("function go() reader() end")
            .unwrap();
        lua.with_borrows()
            .borrow_mut(&mut n)
            .invoke_function::<(), ()>("go", ())
            .unwrap();
    }

    #[test]
    fn borrows_are_cleared_after_the_call() {
        let lua = Lua::new();
        let value = 3i32;

        lua.execute_string::<()>("function noop() end").unwrap();
        lua.with_borrows()
            .borrow(&value)
            .invoke_function::<(), ()>("noop", ())
            .unwrap();

        lua.set(
            Scope::Global,
            "late",
            closure(|lua: &Lua| {
                let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                    *lua.get_borrow::<i32>()
                }));
                assert!(result.is_err());
            }),
        );
        lua.execute_string::<()>("late()").unwrap();
    }
}
