use std::{
    io::{self, Write},
    path::{Path, PathBuf},
    sync::Arc,
    thread::{self, JoinHandle},
};

use parking_lot::{Mutex, RwLock};

use crate::{
    BackgroundPool, CompiledModule, Entity, Heap, HeapCreateInfo, HeapSettings,
    Internal, InternedStrings, Machine, ModuleId, ModuleManager, ModuleState,
    PoolCreateInfo, Process, ProcessCore, ProcessId, Registry, SpecialClasses,
    VmError, WellKnown, builtins, calls::start_module_init, scheduler,
};

/// Output sink for `print` and the error printer.
pub type Sink = Box<dyn Write + Send>;

/// State shared by every process of one VM.
pub struct VmShared {
    pub strings: InternedStrings,
    pub names: WellKnown,
    pub registry: Arc<Registry>,
    pub special: SpecialClasses,
    pub builtins: ModuleId,
    pub modules: ModuleManager,
    pub pool: Arc<BackgroundPool>,
    pub heap_settings: HeapSettings,
    processes: RwLock<Vec<Arc<Process>>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    out: Mutex<Sink>,
    err: Mutex<Sink>,
}

pub struct Vm {
    inner: Arc<VmShared>,
}

#[derive(Default)]
pub struct VmCreateInfo {
    pub heap: HeapCreateInfo,
    pub pool: PoolCreateInfo,
    pub module_paths: Vec<PathBuf>,
    /// Defaults to stdout.
    pub out: Option<Sink>,
    /// Defaults to stderr.
    pub err: Option<Sink>,
}

/// How the main process ended.
#[derive(Debug)]
pub struct ExitStatus {
    pub process: Arc<Process>,
    /// `EXIT` operand, or the entry task's final resval.
    pub value: Entity,
    /// `value` rendered the way `print` would.
    pub display: String,
    /// The entry task ended in an error.
    pub failed: bool,
    pub uncaught_errors: usize,
}

impl VmShared {
    /// Create and register an empty process. Ids only grow, so a child
    /// always sorts after its parent in the lock order.
    pub fn new_process(self: &Arc<Self>) -> Result<Arc<Process>, VmError> {
        let mut processes = self.processes.write();
        let id = ProcessId(processes.len() as u32 + 1);
        let process = Process::new(id, Heap::new(self.heap_settings, self.registry.clone()));
        {
            let mut core = process.lock();
            core.modules.insert(self.builtins, ModuleState::Ready);
            let reflection = core.heap.allocate(self.special.process);
            core.heap
                .set_plain_internal(reflection, Internal::Process(Some(id)))
                .and_then(|()| core.heap.root(reflection))
                .map_err(|err| VmError::MalformedModule(err.to_string()))?;
            core.reflection = Some(reflection);
        }
        processes.push(process.clone());
        log::debug!("process {id} created");
        Ok(process)
    }

    pub fn process(&self, id: ProcessId) -> Option<Arc<Process>> {
        let index = (id.0 as usize).checked_sub(1)?;
        self.processes.read().get(index).cloned()
    }

    pub fn process_count(&self) -> usize {
        self.processes.read().len()
    }

    /// Run a process's scheduler on a thread of its own.
    pub fn spawn_process_thread(self: &Arc<Self>, process: Arc<Process>) {
        let vm = Arc::clone(self);
        let handle = thread::Builder::new()
            .name(format!("process-{}", process.id))
            .spawn(move || scheduler::run_process(&vm, &process))
            .expect("spawn process thread");
        self.threads.lock().push(handle);
    }

    /// Join every process thread, including ones spawned while joining.
    pub fn join_processes(&self) {
        loop {
            let handle = self.threads.lock().pop();
            let Some(handle) = handle else {
                break;
            };
            if handle.join().is_err() {
                log::error!("a process thread panicked");
            }
        }
    }

    pub fn write_out(&self, text: &str) {
        let mut out = self.out.lock();
        let _ = out.write_all(text.as_bytes());
        let _ = out.flush();
    }

    pub fn write_err(&self, text: &str) {
        let mut err = self.err.lock();
        let _ = err.write_all(text.as_bytes());
        let _ = err.flush();
    }
}

impl Vm {
    pub fn new(info: VmCreateInfo) -> Result<Self, VmError> {
        let heap_settings = info.heap.settings()?;
        let scale = info.pool.scale()?;

        let strings = InternedStrings::new();
        let registry = Arc::new(Registry::new());
        let (builtins, special) = builtins::install(&strings, &registry)?;

        let inner = VmShared {
            names: WellKnown::new(&strings),
            strings,
            registry,
            special,
            builtins,
            modules: ModuleManager::new(info.module_paths),
            pool: BackgroundPool::new(scale),
            heap_settings,
            processes: RwLock::new(Vec::new()),
            threads: Mutex::new(Vec::new()),
            out: Mutex::new(info.out.unwrap_or_else(|| Box::new(io::stdout()))),
            err: Mutex::new(info.err.unwrap_or_else(|| Box::new(io::stderr()))),
        };
        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    pub fn shared(&self) -> &Arc<VmShared> {
        &self.inner
    }

    pub fn strings(&self) -> &InternedStrings {
        &self.inner.strings
    }

    pub fn register(&self, compiled: CompiledModule) -> Result<ModuleId, VmError> {
        self.inner.modules.register(&self.inner, compiled)
    }

    pub fn load_file(&self, path: &Path) -> Result<ModuleId, VmError> {
        self.inner.modules.load_file(&self.inner, path)
    }

    /// Run `module`'s top-level code as the entry task of a fresh main
    /// process on the calling thread, then wait for every process it
    /// spawned.
    pub fn run_main(&self, module: &str) -> Result<ExitStatus, VmError> {
        let vm = &self.inner;
        let module = vm.modules.resolve(vm, vm.strings.add(module))?;
        let process = vm.new_process()?;
        let entry = {
            let mut core = process.lock();
            let entry = start_module_init(&mut core, module, None);
            core.entry_task = Some(entry);
            entry
        };
        process.enqueue(entry);
        scheduler::run_process(vm, &process);
        vm.join_processes();

        let mut guard = process.lock();
        let core: &mut ProcessCore = &mut guard;
        let state = core.task(entry).state;
        let value = core.exit_value.unwrap_or(core.task(entry).resval);
        let uncaught_errors = core.uncaught_errors;
        let display = Machine::new(vm, &process, core, entry).display(value);
        drop(guard);
        Ok(ExitStatus {
            process: process.clone(),
            value,
            display,
            failed: state == crate::TaskState::Error,
            uncaught_errors,
        })
    }
}

impl Drop for Vm {
    fn drop(&mut self) {
        self.inner.join_processes();
        self.inner.pool.shutdown();
    }
}
