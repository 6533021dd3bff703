use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Result;
use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use log::debug;

use pstack::core::corefile::{classify_elf, ElfKind};
use pstack::{inspect, ImageCache, Options, Pid, Process};

// BSD sysexits values.
const EX_USAGE: i32 = 64;
const EX_SOFTWARE: i32 = 70;

fn main() {
    let matches = match arg_parser().try_get_matches() {
        Ok(matches) => matches,
        Err(e)
            if e.kind() == clap::error::ErrorKind::DisplayHelp
                || e.kind() == clap::error::ErrorKind::DisplayVersion =>
        {
            let _ = e.print();
            std::process::exit(0);
        }
        Err(e) => {
            let _ = e.print();
            std::process::exit(EX_USAGE);
        }
    };

    init_logging(matches.get_count("verbose"));

    if !matches.contains_id("targets")
        && !matches.contains_id("dump-elf")
        && !matches.contains_id("dump-dwarf")
    {
        let _ = arg_parser().print_help();
        std::process::exit(EX_USAGE);
    }

    match do_main(&matches) {
        Ok(()) => {}
        Err(e) => {
            eprintln!("error: {:#}", e);
            std::process::exit(EX_SOFTWARE);
        }
    }
}

fn do_main(matches: &ArgMatches) -> Result<()> {
    let stdout = io::stdout();

    if let Some(path) = matches.get_one::<PathBuf>("dump-dwarf") {
        return pstack::output::dump_elf(&mut stdout.lock(), path, true);
    }
    if let Some(path) = matches.get_one::<PathBuf>("dump-elf") {
        return pstack::output::dump_elf(&mut stdout.lock(), path, false);
    }

    let options = Options {
        json: matches.get_flag("json"),
        no_src: matches.get_flag("no-src"),
        do_args: matches.get_flag("args"),
        no_thread_db: matches.get_flag("no-thread-db"),
        python: matches.get_flag("python"),
    };
    let debug_dirs: Vec<PathBuf> = matches
        .get_many::<PathBuf>("debug-dir")
        .map(|dirs| dirs.cloned().collect())
        .unwrap_or_default();
    let sleep_time = matches.get_one::<u64>("batch").copied().unwrap_or(0);
    let targets: Vec<String> = matches
        .get_many::<String>("targets")
        .map(|t| t.cloned().collect())
        .unwrap_or_default();

    // The cache outlives individual targets so batch mode and multi-target
    // invocations parse each image once.
    let cache = ImageCache::new(debug_dirs);

    loop {
        let mut exec_override: Option<PathBuf> = None;
        for target in &targets {
            if let Err(e) = process_target(target, &mut exec_override, &options, &cache) {
                println!("failed to process {}: {:#}", target, e);
            }
        }
        if sleep_time == 0 {
            break;
        }
        std::thread::sleep(Duration::from_secs(sleep_time));
    }
    Ok(())
}

/// One positional argument: a pid if it names a running process, otherwise
/// an ELF file. Non-core ELF files set the executable override used by any
/// core that follows them.
fn process_target(
    target: &str,
    exec_override: &mut Option<PathBuf>,
    options: &Options,
    cache: &ImageCache,
) -> Result<()> {
    let stdout = io::stdout();

    if let Ok(pid) = target.parse::<Pid>() {
        if pid > 0 && Path::new(&format!("/proc/{}", pid)).exists() {
            let mut proc = Process::new_live(pid, exec_override.as_deref(), cache)?;
            let mut out = stdout.lock();
            inspect(&mut proc, options, &mut out)?;
            out.flush()?;
            return Ok(());
        }
    }

    let path = PathBuf::from(target);
    // Only the ELF header is needed to classify; cores can be huge.
    let head = {
        use std::io::Read;
        let mut file = fs::File::open(&path)?;
        let mut buf = [0u8; 64];
        let n = file.read(&mut buf)?;
        if n < buf.len() {
            return Err(anyhow::anyhow!("{} is too short to be an ELF file", target));
        }
        buf
    };
    match classify_elf(&head) {
        ElfKind::Core => {
            let mut proc = Process::new_core(&path, exec_override.as_deref(), cache)?;
            let mut out = stdout.lock();
            inspect(&mut proc, options, &mut out)?;
            out.flush()?;
            Ok(())
        }
        ElfKind::Other => {
            debug!("using {} as executable for subsequent cores", target);
            *exec_override = Some(path);
            Ok(())
        }
        ElfKind::NotElf => Err(anyhow::anyhow!("{} is neither a pid nor an ELF file", target)),
    }
}

fn init_logging(verbosity: u8) {
    let level = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format_timestamp(None)
        .init();
}

fn arg_parser() -> Command {
    Command::new("pstack")
        .about("Print stack traces of processes and core files")
        .version(env!("CARGO_PKG_VERSION"))
        .arg(
            Arg::new("verbose")
                .short('v')
                .action(ArgAction::Count)
                .help("Include verbose information to stderr (repeatable)"),
        )
        .arg(
            Arg::new("json")
                .short('j')
                .action(ArgAction::SetTrue)
                .help("Emit JSON output"),
        )
        .arg(
            Arg::new("no-src")
                .short('s')
                .action(ArgAction::SetTrue)
                .help("Don't include source-level details"),
        )
        .arg(
            Arg::new("args")
                .short('a')
                .action(ArgAction::SetTrue)
                .help("Show arguments to functions where possible"),
        )
        .arg(
            Arg::new("debug-dir")
                .short('g')
                .action(ArgAction::Append)
                .value_parser(value_parser!(PathBuf))
                .help("Add a global debug directory"),
        )
        .arg(
            Arg::new("no-thread-db")
                .short('t')
                .action(ArgAction::SetTrue)
                .help("Don't use the thread library to enumerate threads"),
        )
        .arg(
            Arg::new("python")
                .short('p')
                .action(ArgAction::SetTrue)
                .help("Print python-level stack traces instead of native ones"),
        )
        .arg(
            Arg::new("batch")
                .short('b')
                .value_parser(value_parser!(u64))
                .help("Batch mode: repeat every <BATCH> seconds"),
        )
        .arg(
            Arg::new("dump-elf")
                .short('d')
                .value_parser(value_parser!(PathBuf))
                .help("Dump details of an ELF object as JSON and exit"),
        )
        .arg(
            Arg::new("dump-dwarf")
                .short('D')
                .value_parser(value_parser!(PathBuf))
                .help("Like -d, but include DWARF information"),
        )
        .arg(
            Arg::new("targets")
                .action(ArgAction::Append)
                .help("Pids, cores and executables to examine. An executable overrides where symbols are found for subsequent cores"),
        )
}

#[test]
fn test_arg_parsing() {
    let parser = arg_parser();
    let result = parser
        .try_get_matches_from(vec!["pstack", "-j", "-a", "1234", "./core.1"])
        .unwrap();
    assert!(result.get_flag("json"));
    assert!(result.get_flag("args"));
    assert!(!result.get_flag("python"));
    let targets: Vec<&str> = result
        .get_many::<String>("targets")
        .unwrap()
        .map(|s| s.as_str())
        .collect();
    assert_eq!(targets, ["1234", "./core.1"]);

    let parser = arg_parser();
    let result = parser
        .try_get_matches_from(vec!["pstack", "-b", "5", "-g", "/dbg", "-g", "/dbg2", "42"])
        .unwrap();
    assert_eq!(result.get_one::<u64>("batch"), Some(&5));
    let dirs: Vec<&PathBuf> = result.get_many("debug-dir").unwrap().collect();
    assert_eq!(dirs.len(), 2);

    let parser = arg_parser();
    assert!(parser.try_get_matches_from(vec!["pstack", "-b", "nope"]).is_err());
}
