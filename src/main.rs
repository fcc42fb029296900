use log::{debug, info, warn};
use retrovm::config::VmConfig;
use retrovm::context::{ArchiveKind, ScriptType};
use retrovm::datum::Datum;
use retrovm::host::{ConsoleSurface, ManualClock};
use retrovm::orchestrator::{Orchestrator, RunReport};
use retrovm::resources::DirectoryResources;
use retrovm::unit::load_unit;
use retrovm::vm::ExecState;
use std::env;
use std::path::{Path, PathBuf};

struct Options {
    script: Option<String>,
    config: Option<String>,
    handler: Option<String>,
    args: Vec<Datum>,
    sequence: Option<String>,
    dir: Option<PathBuf>,
    frames: u64,
    frame_ms: u64,
}

fn usage(program: &str) {
    println!("retrovm - resumable script VM for legacy adventure engines");
    println!();
    println!("Usage: {} [options] [script]", program);
    println!();
    println!("Options:");
    println!("  --config FILE     VM settings in TOML");
    println!("  --handler NAME    Call NAME instead of the script's first handler");
    println!("  --arg VALUE       Argument for --handler (repeatable)");
    println!("  --sequence NAME   Play an ADS sequence resource");
    println!("  --dir DIR         Resource directory (default: the script's directory)");
    println!("  --frames N        Stop after N frames (default 600)");
    println!("  --frame-ms MS     Simulated frame length (default 16)");
    println!();
    println!("Examples:");
    println!("  {} demos/countdown.rvm", program);
    println!("  {} --dir data --sequence INTRO.ADS", program);
}

fn parse_number(flag: &str, value: Option<&String>) -> Result<u64, String> {
    let value = value.ok_or(format!("{} needs a value", flag))?;
    value
        .parse()
        .map_err(|_| format!("Invalid value for {}: {}", flag, value))
}

/// Script arguments: integers and floats as numbers, `#name` as a symbol,
/// anything else as a string
fn parse_arg(text: &str) -> Datum {
    if let Ok(i) = text.parse::<i32>() {
        return Datum::Int(i);
    }
    if let Ok(f) = text.parse::<f64>() {
        return Datum::Float(f);
    }
    match text.strip_prefix('#') {
        Some(name) if !name.is_empty() => Datum::symbol(name),
        _ => Datum::string(text),
    }
}

fn parse_options(args: &[String]) -> Result<Options, String> {
    let mut options = Options {
        script: None,
        config: None,
        handler: None,
        args: Vec::new(),
        sequence: None,
        dir: None,
        frames: 600,
        frame_ms: 16,
    };
    let mut i = 1;
    while i < args.len() {
        let flag = args[i].as_str();
        let value = args.get(i + 1);
        match flag {
            "--config" => options.config = value.cloned(),
            "--handler" => options.handler = value.cloned(),
            "--arg" => options.args.extend(value.map(|v| parse_arg(v))),
            "--sequence" => options.sequence = value.cloned(),
            "--dir" => options.dir = value.map(PathBuf::from),
            "--frames" => options.frames = parse_number(flag, value)?,
            "--frame-ms" => options.frame_ms = parse_number(flag, value)?,
            arg if !arg.starts_with('-') => {
                options.script = Some(arg.to_string());
                i += 1;
                continue;
            }
            _ => return Err(format!("Unknown option: {}", flag)),
        }
        if value.is_none() {
            return Err(format!("{} needs a value", flag));
        }
        i += 2;
    }
    if options.script.is_none() && options.sequence.is_none() {
        return Err("Nothing to run: give a script or --sequence".to_string());
    }
    Ok(options)
}

fn report(what: &str, report: &RunReport) -> bool {
    match &report.state {
        ExecState::Aborted(reason) => {
            eprintln!("{} aborted: {}", what, reason);
            false
        }
        ExecState::Yielded => {
            debug!("{} parked on channel {:?}", what, report.channel);
            true
        }
        _ => {
            if let Some(result) = &report.result {
                if *result != Datum::Void {
                    println!("=> {}", result);
                }
            }
            true
        }
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let args: Vec<String> = env::args().collect();
    if args.len() < 2 || args.iter().any(|a| a == "-h" || a == "--help") {
        usage(&args[0]);
        return Ok(());
    }

    let options = match parse_options(&args) {
        Ok(options) => options,
        Err(e) => {
            eprintln!("Error: {}", e);
            eprintln!("Try '{} --help'", args[0]);
            std::process::exit(1);
        }
    };

    let config = match &options.config {
        Some(path) => VmConfig::load(Path::new(path))?,
        None => VmConfig::default(),
    };
    debug!("VM config: {:?}", config);

    let dir = options
        .dir
        .clone()
        .or_else(|| {
            options
                .script
                .as_ref()
                .and_then(|s| Path::new(s).parent().map(Path::to_path_buf))
        })
        .unwrap_or_else(|| PathBuf::from("."));
    info!("Resource directory {}", dir.display());

    let clock = ManualClock::new();
    let mut orchestrator = Orchestrator::new(
        config,
        Box::new(DirectoryResources::new(dir)),
        Box::new(clock.clone()),
        Box::new(ConsoleSurface),
    );

    let mut ok = true;
    if let Some(path) = &options.script {
        let data = match std::fs::read(path) {
            Ok(data) => data,
            Err(e) => {
                eprintln!("Error: Cannot read script '{}': {}", path, e);
                std::process::exit(1);
            }
        };
        let defs = load_unit(&data, ScriptType::Movie)?;
        info!("Loaded {} handlers from {}", defs.len(), path);
        orchestrator.publish(ArchiveKind::Local, ScriptType::Movie, 1, defs);

        let run = match &options.handler {
            Some(name) => orchestrator.call_handler(name, options.args.clone())?,
            None => Some(orchestrator.run_script(ScriptType::Movie, 1, 0)?),
        };
        match run {
            Some(run) => ok &= report(path, &run),
            None => {
                eprintln!("No handler to run in {}", path);
                ok = false;
            }
        }
    }

    if let Some(name) = &options.sequence {
        orchestrator.start_sequence(name)?;
    }

    while !orchestrator.is_idle() && orchestrator.frame() < options.frames {
        clock.advance(options.frame_ms);
        let tick = orchestrator.tick();
        for (channel, state) in &tick.finished {
            if let ExecState::Aborted(reason) = state {
                eprintln!("Channel {} aborted: {}", channel, reason);
                ok = false;
            }
        }
        for name in &tick.sequences_finished {
            info!("Sequence {} finished at frame {}", name, tick.frame);
        }
    }
    if !orchestrator.is_idle() {
        warn!("Still running after {} frames, stopping", options.frames);
        orchestrator.stop_all();
    }

    let diagnostics = orchestrator.vm_mut().take_diagnostics();
    if !diagnostics.is_empty() {
        eprintln!("{} diagnostics:", diagnostics.len());
        for d in &diagnostics {
            eprintln!("  {:?}: {}", d.kind, d.message);
        }
    }

    if !ok {
        std::process::exit(1);
    }
    Ok(())
}
