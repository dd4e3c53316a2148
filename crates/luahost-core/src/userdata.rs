//! Host values stored on the lua heap as full userdata.

use std::any::{Any, TypeId};
use std::cell::RefCell;
use std::mem;
use std::ops::Deref;
use std::os::raw::c_int;
use std::ptr;
use std::rc::Rc;

use ahash::AHashMap;

use crate::stack::{self, RawState, StackValue};
use crate::sys;
use crate::value::Value;
use crate::{Error, Lua, Ref};

/// Registry key of the per-state metatable cache.
pub(crate) const METATABLE_CACHE_KEY: &[u8] = b"luahost_metatables\0";

/// Maps a host type to the registry reference of its metatable.
pub(crate) type MetatableCache = RefCell<AHashMap<TypeId, c_int>>;

/// Returns the registry reference of the metatable cached for `T`,
/// building it with `build` on first use. `build` must leave nothing on
/// the stack and return a registry reference.
pub(crate) unsafe fn metatable_for<T: Any>(
    state: &Rc<RawState>,
    build: impl FnOnce(*mut sys::lua_State) -> c_int,
) -> c_int {
    let cache = stack::registry_ptr::<MetatableCache>(state.ptr, METATABLE_CACHE_KEY);
    // The cache must not stay borrowed while `build` runs: building a
    // metatable can push closures, which consult the cache themselves.
    if let Some(&mt) = (*cache).borrow().get(&TypeId::of::<T>()) {
        return mt;
    }
    let mt = build(state.ptr);
    (*cache).borrow_mut().insert(TypeId::of::<T>(), mt);
    mt
}

/// Marks a type as safe to pass to and from lua via [`Ref`].
pub trait LuaUsable: Any {
    /// Adds fields to the type that can be used in lua.
    fn fields(_t: &TypeBuilder) {}

    /// Adds fields to the type's metatable.
    fn metatable(_t: &TypeBuilder) {}
}

impl<T> LuaUsable for RefCell<T>
where
    T: LuaUsable,
{
    fn fields(t: &TypeBuilder) {
        T::fields(t)
    }
    fn metatable(t: &TypeBuilder) {
        T::metatable(t)
    }
}

impl<T> LuaUsable for Option<T>
where
    T: LuaUsable,
{
    fn fields(t: &TypeBuilder) {
        T::fields(t)
    }
    fn metatable(t: &TypeBuilder) {
        T::metatable(t)
    }
}

impl LuaUsable for i8 {}
impl LuaUsable for i16 {}
impl LuaUsable for i32 {}
impl LuaUsable for i64 {}
impl LuaUsable for u8 {}
impl LuaUsable for u16 {}
impl LuaUsable for u32 {}
impl LuaUsable for u64 {}
impl LuaUsable for f32 {}
impl LuaUsable for f64 {}
impl LuaUsable for bool {}

impl<K: 'static, V: 'static, H: 'static> LuaUsable for std::collections::HashMap<K, V, H> {}
impl<T: 'static> LuaUsable for Vec<T> {}
impl<T: 'static> LuaUsable for std::sync::Arc<T> {}
impl<T: 'static> LuaUsable for std::rc::Rc<T> {}
impl<T: 'static> LuaUsable for std::rc::Weak<T> {}

/// Used to append fields to a custom lua type while its `__index` table
/// (or metatable) sits on top of the stack.
pub struct TypeBuilder {
    /// Access to the lua engine.
    pub lua: Lua,
}

impl TypeBuilder {
    /// Adds the field to the type currently being built.
    pub fn field<T>(&self, name: &str, val: T)
    where
        T: Value,
    {
        unsafe {
            stack::push_string(self.lua.state.ptr, name);
            val.push(&self.lua.state).unwrap();
            sys::lua_rawset(self.lua.state.ptr, -3);
        }
    }

    /// Gets the field from the type currently being built.
    pub fn get_field<T>(&self, name: &str) -> T
    where
        T: Value,
    {
        unsafe {
            stack::push_string(self.lua.state.ptr, name);
            sys::lua_rawget(self.lua.state.ptr, -2);
            let val = T::read(&self.lua.state, -1);
            sys::lua_pop(self.lua.state.ptr, 1);
            val.unwrap()
        }
    }

    /// Builds the metatable of the type currently being built.
    pub fn metatable<F>(&self, f: F)
    where
        F: FnOnce(&TypeBuilder),
    {
        unsafe {
            sys::lua_createtable(self.lua.state.ptr, 0, 0);
            f(&TypeBuilder {
                lua: Lua {
                    state: self.lua.state.clone(),
                },
            });
            sys::lua_setmetatable(self.lua.state.ptr, -2);
        }
    }
}

unsafe extern "C" fn free_value<T: Any>(state: *mut sys::lua_State) -> c_int {
    let val: *mut T = sys::lua_touserdata(state, 1) as *mut T;
    ptr::drop_in_place(val);
    0
}

impl<T> Ref<T>
where
    T: LuaUsable,
{
    /// Places the value on the lua heap.
    pub fn new(lua: &Lua, val: T) -> Ref<T> {
        unsafe {
            let state = RawState::root(lua.state.clone());
            let data = sys::lua_newuserdata(state.ptr, mem::size_of::<T>());
            ptr::write(data as *mut T, val);

            let mt = metatable_for::<T>(&state, |ptr| unsafe {
                sys::lua_createtable(ptr, 0, 3);

                stack::push_string(ptr, "__index");
                sys::lua_createtable(ptr, 0, 0);
                T::fields(&TypeBuilder {
                    lua: Lua {
                        state: state.clone(),
                    },
                });
                sys::lua_settable(ptr, -3);

                stack::push_string(ptr, "__gc");
                sys::lua_pushcclosure(ptr, Some(free_value::<T>), 0);
                sys::lua_settable(ptr, -3);

                T::metatable(&TypeBuilder {
                    lua: Lua {
                        state: state.clone(),
                    },
                });

                // Lock the table
                stack::push_string(ptr, "__metatable");
                sys::lua_pushboolean(ptr, 0);
                sys::lua_settable(ptr, -3);
                sys::luaL_ref(ptr, sys::LUA_REGISTRYINDEX)
            });
            sys::lua_rawgeti(state.ptr, sys::LUA_REGISTRYINDEX, mt);
            sys::lua_setmetatable(state.ptr, -2);
            Ref::register(&state)
        }
    }
}

impl<T> Deref for Ref<T>
where
    T: LuaUsable,
{
    type Target = T;
    #[inline]
    fn deref(&self) -> &T {
        let state = self
            .upgrade()
            .expect("dereferencing a value of a shut down lua instance");
        unsafe {
            self.push_slot(&state);
            let val = sys::lua_touserdata(state.ptr, -1) as *mut T;
            assert!(!val.is_null());
            sys::lua_pop(state.ptr, 1);
            &*val
        }
    }
}

impl<T> Value for Ref<T> where T: LuaUsable {}
unsafe impl<T> StackValue for Ref<T>
where
    T: LuaUsable,
{
    unsafe fn read(state: &Rc<RawState>, idx: c_int) -> Result<Self, Error> {
        if sys::lua_type(state.ptr, idx) != sys::LUA_TUSERDATA {
            return Err(Error::TypeMismatch {
                wanted: "<native type>",
            });
        }
        // Unlike the callable slot this boundary is checked: the value is
        // only accepted when its metatable is the one cached for T.
        if sys::lua_getmetatable(state.ptr, idx) == 0 {
            return Err(Error::TypeMismatch {
                wanted: "<native type>",
            });
        }
        let cache = stack::registry_ptr::<MetatableCache>(state.ptr, METATABLE_CACHE_KEY);
        let mt = (*cache).borrow().get(&TypeId::of::<T>()).copied();
        let mt = match mt {
            Some(mt) => mt,
            None => {
                sys::lua_pop(state.ptr, 1);
                return Err(Error::TypeMismatch {
                    wanted: "<native type>",
                });
            }
        };

        sys::lua_rawgeti(state.ptr, sys::LUA_REGISTRYINDEX, mt);
        let equal = sys::lua_rawequal(state.ptr, -1, -2);
        sys::lua_pop(state.ptr, 2);
        if equal != 0 {
            sys::lua_pushvalue(state.ptr, idx);
            Ok(Ref::register(state))
        } else {
            Err(Error::TypeMismatch {
                wanted: "<native type>",
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{closure2, Scope};

    #[test]
    fn userdata_fields_mutate_host_value() {
        let lua = Lua::new();
        struct CustomType {
            thing: i32,
        }
        impl LuaUsable for CustomType {
            fn fields(t: &TypeBuilder) {
                t.field(
                    "change",
                    closure2(|_, c: Ref<RefCell<CustomType>>, val: i32| {
                        let mut c = c.borrow_mut();
                        c.thing = val;
                    }),
                );
            }
        }

        lua.set(
            Scope::Global,
            "custom",
            Ref::new(&lua, RefCell::new(CustomType { thing: -5 })),
        );
        {
            let c = lua
                .get::<Ref<RefCell<CustomType>>>(Scope::Global, "custom")
                .unwrap();
            assert_eq!(c.borrow().thing, -5);
        }

        lua.execute_string::<()>("custom:change(22)").unwrap();

        {
            let c = lua
                .get::<Ref<RefCell<CustomType>>>(Scope::Global, "custom")
                .unwrap();
            assert_eq!(c.borrow().thing, 22);
        }
    }

    #[test]
    fn userdata_dropped_by_gc() {
        struct CustomType {
            drop_check: *mut i32,
        }
        impl LuaUsable for CustomType {}
        impl Drop for CustomType {
            fn drop(&mut self) {
                unsafe {
                    (*self.drop_check) += 1;
                }
            }
        }

        let mut drop_check = 0;
        {
            let lua = Lua::new();
            lua.set(
                Scope::Global,
                "custom",
                Ref::new(
                    &lua,
                    CustomType {
                        drop_check: &mut drop_check,
                    },
                ),
            );
            lua.execute_string::<()>("local temp = custom").unwrap();
        }
        assert_eq!(drop_check, 1);
    }

    #[test]
    fn wrong_userdata_type_is_rejected() {
        let lua = Lua::new();
        struct TypeA;
        struct TypeB;
        impl LuaUsable for TypeA {}
        impl LuaUsable for TypeB {}

        lua.set(Scope::Global, "a", Ref::new(&lua, TypeA));
        assert!(matches!(
            lua.get::<Ref<TypeB>>(Scope::Global, "a"),
            Err(Error::TypeMismatch { .. })
        ));
        assert!(lua.get::<Ref<TypeA>>(Scope::Global, "a").is_ok());
    }
}
