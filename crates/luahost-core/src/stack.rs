//! Crate-internal view of the interpreter state and the stack conversion
//! trait backing [`Value`](crate::Value).

use std::ffi::CString;
use std::os::raw::c_int;
use std::ptr;
use std::rc::Rc;

use crate::sys;
use crate::Error;

/// A raw interpreter handle.
///
/// The root instance owns the `lua_State` and closes it on drop. Handles
/// created for callback invocations on the same state keep a link to their
/// parent instead so the state is only ever closed once.
pub(crate) struct RawState {
    pub(crate) ptr: *mut sys::lua_State,
    pub(crate) parent: Option<Rc<RawState>>,
}

impl RawState {
    /// Walks up to the owning root handle.
    pub(crate) fn root(node: Rc<RawState>) -> Rc<RawState> {
        if let Some(p) = node.parent.clone() {
            Self::root(p)
        } else {
            node
        }
    }
}

impl Drop for RawState {
    fn drop(&mut self) {
        if self.parent.is_some() {
            return;
        }
        log::debug!("closing lua state");
        unsafe {
            // The side tables are plain userdata without __gc metamethods,
            // so their Rust payloads have to be dropped by hand before the
            // interpreter frees the backing memory.
            ptr::drop_in_place(registry_ptr::<crate::userdata::MetatableCache>(
                self.ptr,
                crate::userdata::METATABLE_CACHE_KEY,
            ));
            ptr::drop_in_place(registry_ptr::<crate::borrow::BorrowTable>(
                self.ptr,
                crate::borrow::BORROW_TABLE_KEY,
            ));
            sys::lua_close(self.ptr);
        }
    }
}

/// Conversion between Rust values and slots on the interpreter stack.
///
/// Unsafe because implementations issue raw stack operations and must keep
/// `slots()` consistent with what `push`/`read` actually touch.
pub unsafe trait StackValue: Sized {
    /// Reads the value starting at `idx` without popping it.
    unsafe fn read(state: &Rc<RawState>, idx: c_int) -> Result<Self, Error>;

    /// Number of stack slots the value occupies.
    fn slots() -> c_int;

    /// Pushes the value onto the stack.
    unsafe fn push(self, state: &Rc<RawState>) -> Result<(), Error>;
}

/// Fetches the Rust payload of a side table stored in the registry under
/// `key` (which must be NUL-terminated).
pub(crate) unsafe fn registry_ptr<T>(state: *mut sys::lua_State, key: &[u8]) -> *mut T {
    debug_assert_eq!(key.last(), Some(&0));
    sys::lua_getfield(state, sys::LUA_REGISTRYINDEX, key.as_ptr() as *const _);
    let p = sys::lua_touserdata(state, -1) as *mut T;
    sys::lua_pop(state, 1);
    p
}

pub(crate) unsafe fn push_string<S>(state: *mut sys::lua_State, s: S)
where
    S: Into<Vec<u8>>,
{
    let s = CString::new(s).unwrap();
    sys::lua_pushstring(state, s.as_ptr());
}

/// Pops and returns the error value left on the stack by a failed
/// `lua_pcall`/`luaL_loadbuffer`.
pub(crate) unsafe fn take_error(state: &Rc<RawState>) -> Error {
    let msg: Result<crate::Ref<String>, Error> = StackValue::read(state, -1);
    sys::lua_pop(state.ptr, 1);
    let err = match msg {
        Ok(msg) => Error::Runtime {
            msg: msg.to_string().into_boxed_str(),
        },
        Err(err) => err,
    };
    log::debug!("script failure: {err}");
    err
}
