use log::debug;
use retrovm::context::ScriptType;
use retrovm::disassembler::{disassemble_unit, list_unit};
use retrovm::track::decode_track;
use retrovm::unit::{load_unit, to_bytes};
use std::env;
use std::fs::File;
use std::io::{Read, Write};

#[derive(Debug, Clone, Copy, PartialEq)]
enum Mode {
    Listing,
    Source,
    Track,
    Compile,
}

fn usage(program: &str) {
    eprintln!("Usage: {} [options] <file>", program);
    eprintln!("\nOptions:");
    eprintln!("  --listing        Offsets, raw words and instructions (default)");
    eprintln!("  --source         Assembler source that reassembles to the same unit");
    eprintln!("  --track          Decode the file as a TTM track");
    eprintln!("  --compile OUT    Write the unit in binary RVMU form to OUT");
    eprintln!("  --type NAME      Script type for source input (movie, score, sprite, cast)");
    eprintln!("  -h               Show this help message");
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let args: Vec<String> = env::args().collect();

    let mut mode = Mode::Listing;
    let mut script_type = ScriptType::Movie;
    let mut output = None;
    let mut filename = None;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--listing" => mode = Mode::Listing,
            "--source" => mode = Mode::Source,
            "--track" => mode = Mode::Track,
            "--compile" => {
                mode = Mode::Compile;
                i += 1;
                output = args.get(i).cloned();
            }
            "--type" => {
                i += 1;
                let name = args.get(i).map(String::as_str).unwrap_or("");
                script_type = match ScriptType::from_name(name) {
                    Some(t) => t,
                    None => {
                        eprintln!("Unknown script type: {}", name);
                        std::process::exit(1);
                    }
                };
            }
            "-h" | "--help" => {
                usage(&args[0]);
                std::process::exit(0);
            }
            arg if !arg.starts_with('-') => {
                filename = Some(arg.to_string());
                break;
            }
            _ => {
                eprintln!("Unknown option: {}", args[i]);
                std::process::exit(1);
            }
        }
        i += 1;
    }

    let filename = filename.unwrap_or_else(|| {
        usage(&args[0]);
        std::process::exit(1);
    });

    let mut file = File::open(&filename)?;
    let mut data = Vec::new();
    file.read_to_end(&mut data)?;
    debug!("Loaded {} bytes from {}", data.len(), filename);

    if mode == Mode::Track {
        for inst in decode_track(&data)? {
            println!("{}", inst);
        }
        return Ok(());
    }

    let defs = load_unit(&data, script_type)?;
    debug!("{} handlers in {}", defs.len(), filename);

    match mode {
        Mode::Listing => print!("{}", list_unit(&defs)),
        Mode::Source => print!("{}", disassemble_unit(&defs)?),
        Mode::Compile => {
            let path = output.unwrap_or_else(|| {
                eprintln!("--compile needs an output file");
                std::process::exit(1);
            });
            let bytes = to_bytes(&defs);
            File::create(&path)?.write_all(&bytes)?;
            println!("Wrote {} handlers ({} bytes) to {}", defs.len(), bytes.len(), path);
        }
        Mode::Track => {}
    }
    Ok(())
}
