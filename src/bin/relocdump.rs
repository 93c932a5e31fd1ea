//! Print the relocation records persisted in an AOT object.

use clap::Parser;
use emitcore::aot::{decode_relocation_data, object_file::read_object};
use emitcore::debug::write_records;
use std::fs;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "relocdump")]
#[command(about = "Decode the relocation records of an AOT compiled method")]
#[command(version)]
struct Cli {
    /// Object file written for an AOT compiled method
    file: PathBuf,

    /// Also print the method code as hex
    #[arg(long)]
    code: bool,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let cli = Cli::parse();

    let bytes = fs::read(&cli.file)?;
    let method = read_object(&bytes)?;
    log::debug!(
        "{}: {} code bytes, {} relocation bytes",
        cli.file.display(),
        method.code.len(),
        method.relocation_data.len()
    );

    let target = method.arch.encoder();
    let records = decode_relocation_data(&method.relocation_data, target.as_ref())?;

    println!("{} ({}, {} bytes)", method.name, method.arch.name(), method.code.len());
    let mut out = String::new();
    write_records(&mut out, &records)?;
    print!("{out}");

    if cli.code {
        for (row, chunk) in method.code.chunks(16).enumerate() {
            let hex: Vec<String> = chunk.iter().map(|b| format!("{b:02x}")).collect();
            println!("{:08x}  {}", row * 16, hex.join(" "));
        }
    }
    Ok(())
}
