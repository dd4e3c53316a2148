fn main() {
    // Compile and statically link the vendored Lua 5.1 sources.
    let artifacts = lua_src::Build::new().build(lua_src::Version::Lua51);
    artifacts.print_cargo_metadata();
}
