//! The bridge between the interpreter's C calling convention and host
//! closures.
//!
//! Every host closure pushed into the interpreter is represented as a C
//! closure over [`trampoline`], carrying one upvalue: a full userdata whose
//! payload starts with a [`ClosureRecord`]. The trampoline fetches the
//! record, dispatches to its entry point, and translates the sentinel
//! return code into the interpreter's error mechanism.

use std::os::raw::c_int;

use crate::sys;

/// Pseudo-index of the slot holding the closure record of the callable
/// currently being invoked.
pub(crate) const CLOSURE_SLOT: c_int = sys::lua_upvalueindex(1);

/// Sentinel returned by an entry point to signal that it has pushed an
/// error value and wants it raised. Any other return is the number of
/// results pushed.
pub(crate) const SIGNAL_ERROR: c_int = -1;

/// Entry point stored in a [`ClosureRecord`]. Receives the interpreter
/// state with the call's arguments on its stack.
pub(crate) type Entry = unsafe extern "C" fn(state: *mut sys::lua_State) -> c_int;

/// Header of the userdata stored in [`CLOSURE_SLOT`].
///
/// Registration code allocates a larger `#[repr(C)]` structure carrying the
/// captured Rust closure behind this header; the trampoline only ever looks
/// at the header.
#[repr(C)]
pub(crate) struct ClosureRecord {
    pub(crate) entry: Entry,
}

/// Fetches the closure record of the callable currently being invoked.
///
/// # Safety
/// This is the trusted boundary of the whole layer: the caller must be a C
/// closure installed by [`crate::closures`] so that `CLOSURE_SLOT` holds a
/// live, correctly-typed record. Nothing is verified at runtime beyond a
/// debug-build null check.
pub(crate) unsafe fn closure_record(state: *mut sys::lua_State) -> *mut ClosureRecord {
    sys::lua_touserdata(state, CLOSURE_SLOT) as *mut ClosureRecord
}

/// Adapts one interpreter-native call into one host-native call.
///
/// On the non-error path the entry point's return value is handed back to
/// the interpreter unchanged. On the error path (`SIGNAL_ERROR`) control
/// transfers into the interpreter's error propagation; `lua_error` does not
/// return under the default configuration, but its result is still
/// propagated so the function stays well-defined if it ever does.
pub(crate) unsafe extern "C" fn trampoline(state: *mut sys::lua_State) -> c_int {
    let record = closure_record(state);
    debug_assert!(!record.is_null(), "callable slot holds no closure record");
    let ret = ((*record).entry)(state);
    if ret == SIGNAL_ERROR {
        return sys::lua_error(state);
    }
    ret
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{closure, Error, Lua, Scope};
    use std::ffi::CString;
    use std::ptr;

    /// Installs `entry` as a global function the raw way: a userdata
    /// holding just the record, wrapped by the trampoline.
    fn install(lua: &Lua, name: &str, entry: Entry) {
        unsafe {
            let data = sys::lua_newuserdata(
                lua.state.ptr,
                std::mem::size_of::<ClosureRecord>(),
            );
            ptr::write(data as *mut ClosureRecord, ClosureRecord { entry });
            sys::lua_pushcclosure(lua.state.ptr, Some(trampoline), 1);
            let c_name = CString::new(name).unwrap();
            sys::lua_setfield(lua.state.ptr, sys::LUA_GLOBALSINDEX, c_name.as_ptr());
        }
    }

    unsafe extern "C" fn push_pair(state: *mut sys::lua_State) -> c_int {
        sys::lua_pushnumber(state, 3.0);
        sys::lua_pushnumber(state, 4.0);
        2
    }

    unsafe extern "C" fn push_nothing(_state: *mut sys::lua_State) -> c_int {
        0
    }

    unsafe extern "C" fn boom(state: *mut sys::lua_State) -> c_int {
        crate::stack::push_string(state, "boom");
        SIGNAL_ERROR
    }

    #[test]
    fn pass_through_on_success() {
        let lua = Lua::new();
        install(&lua, "pair", push_pair);
        let (a, b) = lua.execute_string::<(f64, f64)>("return pair()").unwrap();
        assert_eq!(a, 3.0);
        assert_eq!(b, 4.0);

        install(&lua, "nothing", push_nothing);
        lua.execute_string::<()>("assert(nothing() == nil)").unwrap();
    }

    #[test]
    fn error_path_carries_payload() {
        let lua = Lua::new();
        install(&lua, "boom_fn", boom);
        let err = lua.execute_string::<()>("boom_fn()").unwrap_err();
        match err {
            Error::Runtime { msg } => assert!(msg.contains("boom"), "got: {msg}"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn error_is_catchable_in_script() {
        let lua = Lua::new();
        install(&lua, "boom_fn", boom);
        lua.execute_string::<()>(
            r#"
    local ok, err = pcall(boom_fn)
    assert(not ok)
    assert(err == "boom")
        "#,
        )
        .unwrap();
    }

    #[test]
    fn record_state_is_stable_across_calls() {
        let lua = Lua::new();
        let mut count = 0u32;
        lua.set(
            Scope::Global,
            "bump",
            closure(move |_| {
                count += 1;
                count as i32
            }),
        );
        lua.execute_string::<()>(
            r#"
    assert(bump() == 1)
    assert(bump() == 2)
    assert(bump() == 3)
        "#,
        )
        .unwrap();
    }

    #[test]
    fn reentrant_invocation() {
        let lua = Lua::new();
        lua.set(
            Scope::Global,
            "inner",
            closure(|_| 21i32),
        );
        lua.set(
            Scope::Global,
            "outer",
            closure(|lua: &Lua| -> Result<i32, Error> {
                let inner: i32 = lua.invoke_function("mid", ())?;
                Ok(inner * 2)
            }),
        );
        lua.execute_string::<()>("function mid() return inner() end")
            .unwrap();
        let ret: i32 = lua.execute_string("return outer()").unwrap();
        assert_eq!(ret, 42);
    }

    #[test]
    fn independent_states_on_separate_threads() {
        let mk = |tag: i32| {
            std::thread::spawn(move || {
                let lua = Lua::new();
                lua.set(Scope::Global, "tag", closure(move |_| tag));
                for _ in 0..100 {
                    let got: i32 = lua.execute_string("return tag()").unwrap();
                    assert_eq!(got, tag);
                }
            })
        };
        let a = mk(1);
        let b = mk(2);
        a.join().unwrap();
        b.join().unwrap();
    }
}
