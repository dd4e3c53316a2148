//! Raw bindings to the Lua 5.1 C API.
//!
//! Only the portion of the API used by `luahost-core` is declared here.
//! Functions keep their C names and signatures; the handful of things lua.h
//! defines as macros (`lua_pop`, `lua_upvalueindex`, ...) are provided as
//! Rust helpers at the bottom.

#![allow(non_camel_case_types, non_snake_case)]

use std::os::raw::{c_char, c_int, c_void};

/// Opaque interpreter state. Always handled behind a raw pointer.
#[repr(C)]
pub struct lua_State {
    _private: [u8; 0],
}

pub type lua_Number = f64;
pub type lua_Integer = isize;

/// Calling convention for functions callable from the interpreter.
pub type lua_CFunction = Option<unsafe extern "C" fn(L: *mut lua_State) -> c_int>;

// Pseudo-indices (Lua 5.1 layout).
pub const LUA_REGISTRYINDEX: c_int = -10000;
pub const LUA_ENVIRONINDEX: c_int = -10001;
pub const LUA_GLOBALSINDEX: c_int = -10002;

// Type tags.
pub const LUA_TNONE: c_int = -1;
pub const LUA_TNIL: c_int = 0;
pub const LUA_TBOOLEAN: c_int = 1;
pub const LUA_TLIGHTUSERDATA: c_int = 2;
pub const LUA_TNUMBER: c_int = 3;
pub const LUA_TSTRING: c_int = 4;
pub const LUA_TTABLE: c_int = 5;
pub const LUA_TFUNCTION: c_int = 6;
pub const LUA_TUSERDATA: c_int = 7;
pub const LUA_TTHREAD: c_int = 8;

// Thread/pcall status codes. 0 means success.
pub const LUA_YIELD: c_int = 1;
pub const LUA_ERRRUN: c_int = 2;
pub const LUA_ERRSYNTAX: c_int = 3;
pub const LUA_ERRMEM: c_int = 4;
pub const LUA_ERRERR: c_int = 5;

pub const LUA_MULTRET: c_int = -1;

// luaL_ref sentinels.
pub const LUA_NOREF: c_int = -2;
pub const LUA_REFNIL: c_int = -1;

extern "C" {
    // State lifecycle
    pub fn luaL_newstate() -> *mut lua_State;
    pub fn luaL_openlibs(L: *mut lua_State);
    pub fn lua_close(L: *mut lua_State);

    // Stack manipulation
    pub fn lua_gettop(L: *mut lua_State) -> c_int;
    pub fn lua_settop(L: *mut lua_State, idx: c_int);
    pub fn lua_pushvalue(L: *mut lua_State, idx: c_int);
    pub fn lua_checkstack(L: *mut lua_State, extra: c_int) -> c_int;

    // Type queries
    pub fn lua_type(L: *mut lua_State, idx: c_int) -> c_int;
    pub fn lua_typename(L: *mut lua_State, tp: c_int) -> *const c_char;
    pub fn lua_isnumber(L: *mut lua_State, idx: c_int) -> c_int;
    pub fn lua_isstring(L: *mut lua_State, idx: c_int) -> c_int;

    // Push primitives
    pub fn lua_pushnil(L: *mut lua_State);
    pub fn lua_pushnumber(L: *mut lua_State, n: lua_Number);
    pub fn lua_pushinteger(L: *mut lua_State, n: lua_Integer);
    pub fn lua_pushboolean(L: *mut lua_State, b: c_int);
    pub fn lua_pushstring(L: *mut lua_State, s: *const c_char);
    pub fn lua_pushlstring(L: *mut lua_State, s: *const c_char, len: usize);
    pub fn lua_pushcclosure(L: *mut lua_State, f: lua_CFunction, n: c_int);
    pub fn lua_pushlightuserdata(L: *mut lua_State, p: *mut c_void);

    // Read primitives
    pub fn lua_tonumber(L: *mut lua_State, idx: c_int) -> lua_Number;
    pub fn lua_tointeger(L: *mut lua_State, idx: c_int) -> lua_Integer;
    pub fn lua_toboolean(L: *mut lua_State, idx: c_int) -> c_int;
    pub fn lua_tolstring(L: *mut lua_State, idx: c_int, len: *mut usize) -> *const c_char;
    pub fn lua_touserdata(L: *mut lua_State, idx: c_int) -> *mut c_void;
    pub fn lua_objlen(L: *mut lua_State, idx: c_int) -> usize;
    pub fn lua_rawequal(L: *mut lua_State, idx1: c_int, idx2: c_int) -> c_int;

    // Tables and metatables
    pub fn lua_createtable(L: *mut lua_State, narr: c_int, nrec: c_int);
    pub fn lua_gettable(L: *mut lua_State, idx: c_int);
    pub fn lua_settable(L: *mut lua_State, idx: c_int);
    pub fn lua_getfield(L: *mut lua_State, idx: c_int, k: *const c_char);
    pub fn lua_setfield(L: *mut lua_State, idx: c_int, k: *const c_char);
    pub fn lua_rawget(L: *mut lua_State, idx: c_int);
    pub fn lua_rawset(L: *mut lua_State, idx: c_int);
    pub fn lua_rawgeti(L: *mut lua_State, idx: c_int, n: c_int);
    pub fn lua_rawseti(L: *mut lua_State, idx: c_int, n: c_int);
    pub fn lua_next(L: *mut lua_State, idx: c_int) -> c_int;
    pub fn lua_getmetatable(L: *mut lua_State, idx: c_int) -> c_int;
    pub fn lua_setmetatable(L: *mut lua_State, idx: c_int) -> c_int;

    // Userdata
    pub fn lua_newuserdata(L: *mut lua_State, size: usize) -> *mut c_void;

    // Calls and errors
    pub fn luaL_loadbuffer(
        L: *mut lua_State,
        buff: *const c_char,
        size: usize,
        name: *const c_char,
    ) -> c_int;
    pub fn lua_pcall(L: *mut lua_State, nargs: c_int, nresults: c_int, errfunc: c_int) -> c_int;
    pub fn lua_error(L: *mut lua_State) -> c_int;
    pub fn luaL_where(L: *mut lua_State, lvl: c_int);
    pub fn lua_concat(L: *mut lua_State, n: c_int);

    // Registry references
    pub fn luaL_ref(L: *mut lua_State, t: c_int) -> c_int;
    pub fn luaL_unref(L: *mut lua_State, t: c_int, r: c_int);
}

/// Pseudo-index of the `i`th upvalue of the running C closure
/// (a macro in lua.h).
pub const fn lua_upvalueindex(i: c_int) -> c_int {
    LUA_GLOBALSINDEX - i
}

/// Pops `n` values off the stack (a macro in lua.h).
///
/// # Safety
/// `L` must be a valid state with at least `n` values on its stack.
pub unsafe fn lua_pop(L: *mut lua_State, n: c_int) {
    lua_settop(L, -n - 1);
}
