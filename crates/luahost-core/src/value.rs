//! Conversions between Rust types and interpreter stack values.

use std::fmt::Display;
use std::os::raw::c_int;
use std::rc::Rc;

use crate::stack::{RawState, StackValue};
use crate::sys;
use crate::Error;

/// A value that can cross the boundary between the host and the
/// interpreter.
///
/// Transfers copy the value; see [`Ref`](crate::Ref) for values that stay
/// on the interpreter heap.
pub trait Value: StackValue {}

impl Value for () {}
unsafe impl StackValue for () {
    unsafe fn read(_state: &Rc<RawState>, _idx: c_int) -> Result<Self, Error> {
        Ok(())
    }

    fn slots() -> c_int {
        0
    }

    unsafe fn push(self, _state: &Rc<RawState>) -> Result<(), Error> {
        Ok(())
    }
}

impl Value for f64 {}
unsafe impl StackValue for f64 {
    unsafe fn read(state: &Rc<RawState>, idx: c_int) -> Result<Self, Error> {
        if sys::lua_isnumber(state.ptr, idx) != 0 {
            Ok(sys::lua_tonumber(state.ptr, idx))
        } else {
            Err(Error::TypeMismatch { wanted: "Number" })
        }
    }

    fn slots() -> c_int {
        1
    }

    unsafe fn push(self, state: &Rc<RawState>) -> Result<(), Error> {
        sys::lua_pushnumber(state.ptr, self);
        Ok(())
    }
}

impl Value for i32 {}
unsafe impl StackValue for i32 {
    unsafe fn read(state: &Rc<RawState>, idx: c_int) -> Result<Self, Error> {
        if sys::lua_isnumber(state.ptr, idx) != 0 {
            Ok(sys::lua_tonumber(state.ptr, idx) as i32)
        } else {
            Err(Error::TypeMismatch { wanted: "Number" })
        }
    }

    fn slots() -> c_int {
        1
    }

    unsafe fn push(self, state: &Rc<RawState>) -> Result<(), Error> {
        sys::lua_pushnumber(state.ptr, f64::from(self));
        Ok(())
    }
}

impl Value for bool {}
unsafe impl StackValue for bool {
    unsafe fn read(state: &Rc<RawState>, idx: c_int) -> Result<Self, Error> {
        Ok(sys::lua_toboolean(state.ptr, idx) != 0)
    }

    fn slots() -> c_int {
        1
    }

    unsafe fn push(self, state: &Rc<RawState>) -> Result<(), Error> {
        sys::lua_pushboolean(state.ptr, self as c_int);
        Ok(())
    }
}

impl<T> Value for Option<T> where T: Value {}
unsafe impl<T> StackValue for Option<T>
where
    T: StackValue,
{
    unsafe fn read(state: &Rc<RawState>, idx: c_int) -> Result<Self, Error> {
        if sys::lua_type(state.ptr, idx) == sys::LUA_TNIL {
            Ok(None)
        } else {
            Ok(Some(T::read(state, idx)?))
        }
    }

    fn slots() -> c_int {
        T::slots()
    }

    unsafe fn push(self, state: &Rc<RawState>) -> Result<(), Error> {
        match self {
            Some(val) => val.push(state)?,
            None => {
                for _ in 0..Self::slots() {
                    sys::lua_pushnil(state.ptr)
                }
            }
        }
        Ok(())
    }
}

// Err pushes nothing; the conversion error takes the error path instead.
impl<T, E> Value for Result<T, E>
where
    T: Value,
    E: Display,
{
}
unsafe impl<T, E> StackValue for Result<T, E>
where
    T: StackValue,
    E: Display,
{
    unsafe fn read(state: &Rc<RawState>, idx: c_int) -> Result<Self, Error> {
        Ok(Ok(T::read(state, idx)?))
    }

    fn slots() -> c_int {
        T::slots()
    }

    unsafe fn push(self, state: &Rc<RawState>) -> Result<(), Error> {
        match self {
            Ok(val) => val.push(state)?,
            Err(err) => {
                return Err(Error::External {
                    err: err.to_string().into_boxed_str(),
                })
            }
        }
        Ok(())
    }
}

macro_rules! impl_tuple {
    ($($param:ident),+) => (
        impl <$($param: Value),+> Value for ($($param),+) {}

        unsafe impl <$($param: Value),+> StackValue for ($($param),+) {
            #[allow(unused_assignments)]
            unsafe fn read(state: &Rc<RawState>, idx: c_int) -> Result<Self, Error> {
                let mut idx = idx;
                Ok(($(
                    {
                        let val = $param::read(state, idx)?;
                        idx += $param::slots();
                        val
                    }
                ),*))
            }

            #[inline]
            fn slots() -> c_int {
                let mut size = 0;
                $(
                    size += $param::slots();
                )*
                size
            }

            #[allow(non_snake_case)]
            unsafe fn push(self, state: &Rc<RawState>) -> Result<(), Error> {
                let ($($param),*) = self;
                $(
                    $param.push(state)?;
                )*
                Ok(())
            }
        }
    )
}

impl_tuple!(A, B);
impl_tuple!(A, B, C);
impl_tuple!(A, B, C, D);
impl_tuple!(A, B, C, D, E);
impl_tuple!(A, B, C, D, E, F);
impl_tuple!(A, B, C, D, E, F, G);
impl_tuple!(A, B, C, D, E, F, G, H);
impl_tuple!(A, B, C, D, E, F, G, H, I);
impl_tuple!(A, B, C, D, E, F, G, H, I, J);
impl_tuple!(A, B, C, D, E, F, G, H, I, J, K);
impl_tuple!(A, B, C, D, E, F, G, H, I, J, K, L);
