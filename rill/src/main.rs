use clap::Parser as ClapParser;
use std::{
    fs,
    path::{Path, PathBuf},
    process,
};

use rill::{HeapCreateInfo, PoolCreateInfo, Vm, VmCreateInfo, asm};

#[derive(ClapParser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Assembled module to run as the main process
    #[arg(help = "The .rasm file to execute")]
    file: PathBuf,

    /// Extra directories searched for imported modules
    #[arg(long = "path", value_name = "DIR")]
    paths: Vec<PathBuf>,

    #[arg(long, help = "Live objects allowed per process after collection")]
    max_objects: Option<usize>,

    #[arg(long, help = "Upper bound on background worker threads")]
    pool_workers: Option<usize>,

    #[arg(long, help = "Print the assembled tape instead of running it")]
    dump: bool,

    #[arg(long, short, help = "Debug logging unless RUST_LOG says otherwise")]
    verbose: bool,
}

fn main() {
    let cli = Cli::parse();

    let default_filter = if cli.verbose { "debug" } else { "warn" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .init();

    if cli.dump {
        dump(&cli.file);
        return;
    }

    let mut module_paths = cli.paths.clone();
    if let Some(dir) = cli.file.parent() {
        module_paths.push(dir.to_path_buf());
    }
    let vm = match Vm::new(VmCreateInfo {
        heap: HeapCreateInfo {
            max_object_count: cli.max_objects,
            ..Default::default()
        },
        pool: PoolCreateInfo {
            max_pool_workers: cli.pool_workers,
            ..Default::default()
        },
        module_paths,
        ..Default::default()
    }) {
        Ok(vm) => vm,
        Err(err) => {
            eprintln!("Error starting vm: {err}");
            process::exit(2);
        }
    };

    let module = match vm.load_file(&cli.file) {
        Ok(_) => cli
            .file
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or_default()
            .to_string(),
        Err(err) => {
            eprintln!("Error loading {}: {err}", cli.file.display());
            process::exit(2);
        }
    };

    match vm.run_main(&module) {
        Ok(status) => {
            log::info!(
                "main process exited with {} ({} uncaught errors)",
                status.display,
                status.uncaught_errors
            );
            if status.failed {
                process::exit(1);
            }
            if let Some(code) = status.value.as_int() {
                process::exit(code as i32);
            }
        }
        Err(err) => {
            eprintln!("Error running {module}: {err}");
            process::exit(2);
        }
    }
}

fn dump(file: &Path) {
    let source = match fs::read_to_string(file) {
        Ok(content) => content,
        Err(err) => {
            eprintln!("Error reading file '{}': {}", file.display(), err);
            process::exit(1);
        }
    };
    let name = file
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("main");
    let strings = rill::InternedStrings::new();
    match asm::assemble(name, &file.display().to_string(), &source, &strings) {
        Ok(module) => {
            println!("== {name} ==");
            print!("{}", module.tape.dump(&strings));
            for f in &module.functions {
                let owner = f.class.as_deref().map(|c| format!("{c}.")).unwrap_or_default();
                println!("func {owner}{} @{} {:?}", f.name, f.ins_pos, f.flags);
            }
            for c in &module.classes {
                println!("class {} {}..{}", c.name, c.start, c.end);
            }
        }
        Err(err) => {
            eprintln!("{err}");
            process::exit(1);
        }
    }
}
