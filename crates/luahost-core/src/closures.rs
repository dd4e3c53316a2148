//! Wrappers exposing Rust closures as lua callables.
//!
//! A pushed closure becomes a full userdata holding a [`ClosureData`]
//! (entry point, the captured closure, and a weak link to its instance),
//! wrapped by the shared [`trampoline`](crate::trampoline::trampoline) C
//! closure with the userdata as its only upvalue. The entry point converts
//! arguments, runs the Rust closure, pushes its results, and reports
//! failures through the sentinel protocol.

use std::any::Any;
use std::marker::PhantomData;
use std::mem;
use std::os::raw::c_int;
use std::ptr;
use std::rc::{Rc, Weak};

use crate::stack::{self, RawState, StackValue};
use crate::sys;
use crate::trampoline::{self, ClosureRecord, SIGNAL_ERROR};
use crate::userdata;
use crate::value::Value;
use crate::{Error, Lua};

/// The userdata payload behind a registered closure. The record must stay
/// the first field so the trampoline can read it without knowing `F`.
#[repr(C)]
struct ClosureData<F> {
    record: ClosureRecord,
    fun: F,
    lua: Weak<RawState>,
}

unsafe extern "C" fn free_closure<T: Any>(state: *mut sys::lua_State) -> c_int {
    let data: *mut T = sys::lua_touserdata(state, 1) as *mut T;
    ptr::drop_in_place(data);
    0
}

macro_rules! impl_closure {
    ($name:ident $num:expr, $($param:ident),*) => (
        #[allow(non_camel_case_types)]
        #[allow(non_snake_case)]
        #[doc(hidden)]
        pub struct $name<$($param,)* Fun, Ret> {
            fun: Fun,
            $($param: PhantomData<$param>,)*
            _ret: PhantomData<Ret>,
        }

        impl <$($param: Value,)* Ret: Value, Fun: FnMut(&Lua, $($param),*) -> Ret + Any> Value for $name<$($param,)* Fun, Ret> {}

        unsafe impl <$($param: Value,)* Ret: Value, Fun: FnMut(&Lua, $($param),*) -> Ret + Any> StackValue for $name<$($param,)* Fun, Ret> {
            unsafe fn push(self, state: &Rc<RawState>) -> Result<(), Error> {
                #[allow(unused_variables, unused_mut, unused_assignments, non_snake_case)]
                unsafe extern "C" fn entry<$($param: Value,)* Ret: Value, Fun: FnMut(&Lua, $($param),*) -> Ret + Any>(state: *mut sys::lua_State) -> c_int {
                    let result = (|| {
                        if sys::lua_gettop(state) != $num {
                            return Err(Error::Runtime {
                                msg: format!("incorrect number of parameters, wanted: {}", $num).into_boxed_str(),
                            });
                        }
                        let data = trampoline::closure_record(state) as *mut ClosureData<Fun>;
                        let data = &mut *data;
                        let parent = data.lua.upgrade().ok_or(Error::Shutdown)?;
                        // Callbacks may run on a child state (e.g. inside a
                        // coroutine); wrap it without taking ownership.
                        let lua = if parent.ptr == state {
                            Lua { state: parent }
                        } else {
                            Lua {
                                state: Rc::new(RawState {
                                    ptr: state,
                                    parent: Some(parent),
                                }),
                            }
                        };

                        let mut idx = 1;
                        $(
                            let $param = $param::read(&lua.state, idx)?;
                            idx += $param::slots();
                        )*
                        let ret = (data.fun)(&lua, $($param),*);
                        ret.push(&lua.state)?;
                        Ok(Ret::slots())
                    })();
                    match result {
                        Ok(val) => val,
                        Err(err) => {
                            // Prefix the current script location, then hand
                            // the error to the trampoline to raise.
                            sys::luaL_where(state, 1);
                            stack::push_string(state, format!(" {}", err));
                            sys::lua_concat(state, 2);
                            SIGNAL_ERROR
                        }
                    }
                }

                let cdata = ClosureData {
                    record: ClosureRecord {
                        entry: entry::<$($param,)* Ret, Fun>,
                    },
                    fun: self.fun,
                    lua: Rc::downgrade(&RawState::root(state.clone())),
                };

                let data = sys::lua_newuserdata(state.ptr, mem::size_of::<ClosureData<Fun>>());
                ptr::write(data as *mut ClosureData<Fun>, cdata);

                // The captured closure has to be dropped once the callable
                // falls out of use on the lua side.
                let mt = userdata::metatable_for::<ClosureData<Fun>>(state, |ptr| unsafe {
                    sys::lua_createtable(ptr, 0, 2);
                    stack::push_string(ptr, "__gc");
                    sys::lua_pushcclosure(ptr, Some(free_closure::<ClosureData<Fun>>), 0);
                    sys::lua_settable(ptr, -3);
                    // Lock the table
                    stack::push_string(ptr, "__metatable");
                    sys::lua_pushboolean(ptr, 0);
                    sys::lua_settable(ptr, -3);
                    sys::luaL_ref(ptr, sys::LUA_REGISTRYINDEX)
                });
                sys::lua_rawgeti(state.ptr, sys::LUA_REGISTRYINDEX, mt);
                sys::lua_setmetatable(state.ptr, -2);
                sys::lua_pushcclosure(state.ptr, Some(trampoline::trampoline), 1);
                Ok(())
            }

            unsafe fn read(_state: &Rc<RawState>, _idx: c_int) -> Result<Self, Error> {
                panic!("can't convert a closure back to rust")
            }

            #[inline]
            fn slots() -> c_int { 1 }
        }

        /// Wraps a closure so it can be passed to lua.
        pub fn $name<$($param: Value,)* Ret: Value, Fun: FnMut(&Lua, $($param),*) -> Ret + Any>(f: Fun) -> impl Value {
            $name {
                fun: f,
                $($param: PhantomData,)*
                _ret: PhantomData,
            }
        }
    )
}

impl_closure!(closure  0, );
impl_closure!(closure1 1, A);
impl_closure!(closure2 2, A, B);
impl_closure!(closure3 3, A, B, C);
impl_closure!(closure4 4, A, B, C, D);
impl_closure!(closure5 5, A, B, C, D, E);
impl_closure!(closure6 6, A, B, C, D, E, F);
impl_closure!(closure7 7, A, B, C, D, E, F, G);
impl_closure!(closure8 8, A, B, C, D, E, F, G, H);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Ref, Scope, Table};

    #[test]
    fn closure_with_args_and_multiple_returns() {
        let lua = Lua::new();
        lua.set(
            Scope::Global,
            "my_func",
            closure1(|_, i: f64| (i * 3.0, i * 5.0)),
        );
        lua.execute_string::<()>(
            r#"
    local a, b = my_func(5)
    assert(a == 15)
    assert(b == 25)
    "#,
        )
        .unwrap();
    }

    #[test]
    fn closure_result_returns() {
        let lua = Lua::new();
        lua.set(
            Scope::Global,
            "test",
            closure(|_| -> Result<(i32, i32), Error> { Ok((5, 7)) }),
        );
        lua.execute_string::<()>(
            r#"
    local a, b = test()
    assert(a == 5)
    assert(b == 7)
    "#,
        )
        .unwrap();

        lua.set(
            Scope::Global,
            "test2",
            closure(|_| -> Option<(i32, i32)> { None }),
        );
        lua.execute_string::<()>(
            r#"
    local a, b = test2()
    assert(a == nil)
    assert(b == nil)
    "#,
        )
        .unwrap();
    }

    #[test]
    fn closure_error_reaches_script() {
        let lua = Lua::new();
        lua.set(
            Scope::Global,
            "will_fail",
            closure(|_| -> Result<(), Error> {
                Err(Error::External {
                    err: "Failed".into(),
                })
            }),
        );

        let err = lua.execute_string::<()>("will_fail()").unwrap_err();
        match err {
            Error::Runtime { msg } => assert!(msg.contains("Failed"), "got: {msg}"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn wrong_argument_count_is_an_error() {
        let lua = Lua::new();
        lua.set(Scope::Global, "one_arg", closure1(|_, i: i32| i));
        assert!(lua.execute_string::<()>("one_arg(1, 2)").is_err());
        assert!(lua.execute_string::<()>("one_arg()").is_err());
        lua.execute_string::<()>("assert(one_arg(9) == 9)").unwrap();
    }

    #[test]
    fn closure_receiving_table() {
        let lua = Lua::new();
        lua.set(
            Scope::Global,
            "mut_table",
            closure1(|lua: &Lua, table: Ref<Table>| {
                table.insert(Ref::new_string(lua, "hello"), 55);
            }),
        );
        lua.execute_string::<()>(
            r#"
    local t = {hello = 5, world = 6}
    mut_table(t)
    assert(t.hello == 55)
    assert(t.world == 6)
    "#,
        )
        .unwrap();
    }
}
