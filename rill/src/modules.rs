use std::path::{Path, PathBuf};

use parking_lot::Mutex;

use crate::{CompiledModule, InternedId, ModuleId, VmError, VmShared, asm};

/// Finds modules by name: already registered ones first, then
/// `<name>.rasm` files under the search paths.
#[derive(Debug, Default)]
pub struct ModuleManager {
    search_paths: Vec<PathBuf>,
    /// Serializes file loads so two processes importing the same module
    /// register it once.
    loading: Mutex<()>,
}

impl ModuleManager {
    pub fn new(search_paths: Vec<PathBuf>) -> Self {
        Self {
            search_paths,
            loading: Mutex::new(()),
        }
    }

    pub fn search_paths(&self) -> &[PathBuf] {
        &self.search_paths
    }

    pub fn register(&self, vm: &VmShared, compiled: CompiledModule) -> Result<ModuleId, VmError> {
        let name = compiled.name.clone();
        let id = vm.registry.register_compiled(
            &vm.strings,
            compiled,
            Some(vm.builtins),
            vm.special.object,
        )?;
        log::debug!("module {name} registered as {}", id.0);
        Ok(id)
    }

    pub fn resolve(&self, vm: &VmShared, name: InternedId) -> Result<ModuleId, VmError> {
        if let Some(id) = vm.registry.module_by_name(name) {
            return Ok(id);
        }
        let _loading = self.loading.lock();
        if let Some(id) = vm.registry.module_by_name(name) {
            return Ok(id);
        }
        let name = vm.strings.get(name);
        for dir in &self.search_paths {
            let path = dir.join(format!("{name}.rasm"));
            if path.is_file() {
                let source = std::fs::read_to_string(&path)?;
                let compiled = asm::assemble(&name, &path.display().to_string(), &source, &vm.strings)?;
                return self.register(vm, compiled);
            }
        }
        Err(VmError::ModuleNotFound(name.to_string()))
    }

    /// Assemble and register a file; the module is named after the file
    /// stem.
    pub fn load_file(&self, vm: &VmShared, path: &Path) -> Result<ModuleId, VmError> {
        let name = path
            .file_stem()
            .and_then(|s| s.to_str())
            .ok_or_else(|| VmError::ModuleNotFound(path.display().to_string()))?;
        let source = std::fs::read_to_string(path)?;
        let compiled = asm::assemble(name, &path.display().to_string(), &source, &vm.strings)?;
        let _loading = self.loading.lock();
        self.register(vm, compiled)
    }
}
