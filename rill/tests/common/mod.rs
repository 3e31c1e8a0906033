#![allow(dead_code)]

use std::{io, sync::Arc};

use parking_lot::Mutex;
use rill::{ExitStatus, Vm, VmCreateInfo, asm};

/// A sink tests can read back after the run.
#[derive(Clone, Default)]
pub struct Capture(Arc<Mutex<Vec<u8>>>);

impl Capture {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.0.lock()).into_owned()
    }
}

impl io::Write for Capture {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

pub struct Run {
    pub status: ExitStatus,
    pub out: String,
    pub err: String,
}

/// Assemble and register every module, then run the first as main.
pub fn run_modules(mut info: VmCreateInfo, modules: &[(&str, &str)]) -> Run {
    let out = Capture::default();
    let err = Capture::default();
    info.out = Some(Box::new(out.clone()));
    info.err = Some(Box::new(err.clone()));
    let vm = Vm::new(info).unwrap();
    for (name, source) in modules {
        let compiled = asm::assemble(name, &format!("{name}.rasm"), source, vm.strings())
            .unwrap_or_else(|e| panic!("{e}"));
        vm.register(compiled).unwrap();
    }
    let status = vm.run_main(modules[0].0).unwrap();
    drop(vm);
    Run {
        status,
        out: out.text(),
        err: err.text(),
    }
}

pub fn run(source: &str) -> Run {
    run_modules(VmCreateInfo::default(), &[("main", source)])
}
