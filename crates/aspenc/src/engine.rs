use mlua::Lua;

/// Script-runtime capability consumed by the pipeline: load a chunk, run it,
/// serialize it back to cacheable bytes. Dropping the runtime closes it.
pub trait PageRuntime {
    type Program;

    fn load(&self, chunk: &[u8], name: &str) -> Result<Self::Program, String>;
    fn run(&self, program: &Self::Program) -> Result<(), String>;
    fn serialize(&self, program: &Self::Program) -> Vec<u8>;
}

/// Lua 5.4 runtime. One engine per request; the compiled page stays loaded in
/// the state until the engine is dropped.
pub struct LuaEngine {
    lua: Lua,
}

impl LuaEngine {
    pub fn new() -> Self {
        Self { lua: Lua::new() }
    }

    pub fn lua(&self) -> &Lua {
        &self.lua
    }
}

impl Default for LuaEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl PageRuntime for LuaEngine {
    type Program = mlua::Function;

    fn load(&self, chunk: &[u8], name: &str) -> Result<mlua::Function, String> {
        self.lua
            .load(chunk)
            .set_name(format!("@{name}"))
            .into_function()
            .map_err(|err| err.to_string())
    }

    fn run(&self, program: &mlua::Function) -> Result<(), String> {
        program.call::<()>(()).map_err(|err| err.to_string())
    }

    fn serialize(&self, program: &mlua::Function) -> Vec<u8> {
        program.dump(false)
    }
}
