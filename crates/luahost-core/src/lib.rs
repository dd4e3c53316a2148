//! Embedding layer for running lua scripts inside a Rust host.
//!
//! A [`Lua`] value owns one interpreter instance. Values move between the
//! host and scripts through the [`Value`] trait, stay on the interpreter
//! heap behind [`Ref`], and host closures become script-callable through
//! the `closure*` wrappers.
//!
//! ```no_run
//! use luahost_core::{closure1, Lua, Scope};
//!
//! let lua = Lua::new();
//! lua.set(Scope::Global, "double", closure1(|_, v: f64| v * 2.0));
//! let doubled: f64 = lua.execute_string("return double(21)").unwrap();
//! assert_eq!(doubled, 42.0);
//! ```

use std::cell::RefCell;
use std::ffi::CString;
use std::mem;
use std::ptr;
use std::rc::Rc;

use ahash::AHashMap;

use luahost_sys as sys;

mod borrow;
mod closures;
mod error;
mod refs;
pub mod serde_support;
mod stack;
mod trampoline;
mod userdata;
mod value;

pub use crate::borrow::{BorrowBuilder, BorrowRef, BorrowRefMut};
pub use crate::closures::{
    closure, closure1, closure2, closure3, closure4, closure5, closure6, closure7, closure8,
};
pub use crate::error::Error;
pub use crate::refs::{Coroutine, Function, Ref, Table, TableIterator, Unknown};
pub use crate::serde_support::{from_table, to_table, with_table_deserializer, with_table_serializer};
pub use crate::userdata::{LuaUsable, TypeBuilder};
pub use crate::value::Value;

use crate::borrow::{BorrowTable, BORROW_TABLE_KEY};
use crate::stack::{RawState, StackValue};
use crate::userdata::{MetatableCache, METATABLE_CACHE_KEY};

/// A lua scripting instance.
///
/// Not `Send`: an instance and every reference into it must stay on the
/// thread that created it.
#[derive(Clone)]
pub struct Lua {
    pub(crate) state: Rc<RawState>,
}

/// Named scopes that `Lua::set` and `Lua::get` can address.
#[derive(Clone, Copy, Debug)]
pub enum Scope {
    /// The global scope, accessible from anywhere in a lua script.
    Global,
    /// The registry, accessible only from the host side.
    ///
    /// Useful for passing data to custom functions without polluting the
    /// globals visible to scripts.
    Registry,
}

impl Scope {
    fn index(self) -> std::os::raw::c_int {
        match self {
            Scope::Global => sys::LUA_GLOBALSINDEX,
            Scope::Registry => sys::LUA_REGISTRYINDEX,
        }
    }
}

impl Lua {
    /// Allocates a lua scripting instance with the standard libraries
    /// loaded.
    pub fn new() -> Lua {
        let lua = Lua {
            state: Rc::new(RawState {
                ptr: unsafe {
                    let s = sys::luaL_newstate();
                    sys::luaL_openlibs(s);
                    s
                },
                parent: None,
            }),
        };
        unsafe {
            // Both side tables live as plain userdata in the registry so
            // they share the interpreter's lifetime; RawState::drop frees
            // their Rust payloads.
            install_side_table::<MetatableCache>(
                lua.state.ptr,
                METATABLE_CACHE_KEY,
                RefCell::new(AHashMap::new()),
            );
            install_side_table::<BorrowTable>(
                lua.state.ptr,
                BORROW_TABLE_KEY,
                RefCell::new(AHashMap::new()),
            );
        }
        log::debug!("created lua state");
        lua
    }

    /// Invokes the named function in the global scope, passing the
    /// parameters and converting the result to the requested type.
    pub fn invoke_function<P: Value, Ret: Value>(&self, name: &str, param: P) -> Result<Ret, Error> {
        self.with_borrows().invoke_function(name, param)
    }

    /// Loads and executes the passed script, converting and returning its
    /// results.
    ///
    /// Works like lua's `loadstring`: precompiled bytecode is accepted
    /// too.
    pub fn execute_string<Ret: Value>(&self, script: &str) -> Result<Ret, Error> {
        self.execute_named_string("<string>", script)
    }

    /// Same as [`execute_string`](Self::execute_string) but the loaded
    /// chunk carries the passed name, which shows up in error locations.
    pub fn execute_named_string<Ret: Value>(&self, name: &str, script: &str) -> Result<Ret, Error> {
        let c_script = CString::new(script).unwrap();
        let c_name = CString::new(name).unwrap();
        unsafe {
            // Used to validate the stack after use
            #[cfg(debug_assertions)]
            let orig_top = sys::lua_gettop(self.state.ptr);

            let status = sys::luaL_loadbuffer(
                self.state.ptr,
                c_script.as_ptr(),
                script.len(),
                c_name.as_ptr(),
            );
            if status != 0 {
                return Err(stack::take_error(&self.state));
            }
            let res = sys::lua_pcall(self.state.ptr, 0, Ret::slots(), 0);
            if res != 0 {
                return Err(stack::take_error(&self.state));
            }
            let ret = Ret::read(&self.state, -Ret::slots());
            sys::lua_pop(self.state.ptr, Ret::slots());

            #[cfg(debug_assertions)]
            debug_assert_eq!(orig_top, sys::lua_gettop(self.state.ptr));
            ret
        }
    }

    /// Stores the value in the scope with the given name.
    pub fn set<T: Value>(&self, scope: Scope, name: &str, val: T) {
        let c_name = CString::new(name).unwrap();
        unsafe {
            val.push(&self.state)
                .expect("failed to push value on to the lua stack");
            sys::lua_setfield(self.state.ptr, scope.index(), c_name.as_ptr());
        }
    }

    /// Returns the value from the scope with the given name.
    ///
    /// Returns an error if the value doesn't match the requested type.
    pub fn get<T: Value>(&self, scope: Scope, name: &str) -> Result<T, Error> {
        let c_name = CString::new(name).unwrap();
        unsafe {
            sys::lua_getfield(self.state.ptr, scope.index(), c_name.as_ptr());
            let val = T::read(&self.state, -T::slots());
            sys::lua_pop(self.state.ptr, T::slots());
            val
        }
    }
}

impl Default for Lua {
    fn default() -> Self {
        Lua::new()
    }
}

unsafe fn install_side_table<T>(state: *mut sys::lua_State, key: &[u8], val: T) {
    debug_assert_eq!(key.last(), Some(&0));
    let data = sys::lua_newuserdata(state, mem::size_of::<T>());
    ptr::write(data as *mut T, val);
    sys::lua_setfield(state, sys::LUA_REGISTRYINDEX, key.as_ptr() as *const _);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn execute_strings() {
        let lua = Lua::new();
        lua.execute_string::<()>("local x = 4 + 5").unwrap();
        assert_eq!(lua.execute_string::<i32>("return 3 * 7").unwrap(), 21);
        assert_eq!(
            lua.execute_string::<(f64, bool)>("return 1.5, true").unwrap(),
            (1.5, true)
        );
        assert!(lua.execute_string::<()>("this is not lua").is_err());
        assert!(lua.execute_string::<()>(r#"error("kaboom")"#).is_err());
    }

    #[test]
    fn named_chunks_show_in_errors() {
        let lua = Lua::new();
        let err = lua
            .execute_named_string::<()>("my_chunk", r#"error("oops")"#)
            .unwrap_err();
        match err {
            Error::Runtime { msg } => assert!(msg.contains("my_chunk"), "got: {msg}"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn set_and_get_scoped_values() {
        let lua = Lua::new();
        lua.set(Scope::Global, "num", 5.0);
        lua.set(Scope::Registry, "hidden", 6.0);

        assert_eq!(lua.get::<f64>(Scope::Global, "num").unwrap(), 5.0);
        assert_eq!(lua.get::<f64>(Scope::Registry, "hidden").unwrap(), 6.0);

        // Registry values must not leak into the script-visible scope.
        lua.execute_string::<()>("assert(num == 5)").unwrap();
        lua.execute_string::<()>("assert(hidden == nil)").unwrap();

        assert!(matches!(
            lua.get::<f64>(Scope::Global, "missing"),
            Err(Error::TypeMismatch { wanted: "Number" })
        ));
    }

    #[test]
    fn invoke_named_function() {
        let lua = Lua::new();
        lua.execute_string::<()>("function add(a, b) return a + b end")
            .unwrap();
        assert_eq!(
            lua.invoke_function::<(f64, f64), f64>("add", (2.0, 3.0))
                .unwrap(),
            5.0
        );
        assert!(lua
            .invoke_function::<(), ()>("does_not_exist", ())
            .is_err());
    }

    #[test]
    fn instances_are_independent() {
        let a = Lua::new();
        let b = Lua::new();
        a.set(Scope::Global, "who", 1.0);
        b.set(Scope::Global, "who", 2.0);
        assert_eq!(a.get::<f64>(Scope::Global, "who").unwrap(), 1.0);
        assert_eq!(b.get::<f64>(Scope::Global, "who").unwrap(), 2.0);
    }
}
