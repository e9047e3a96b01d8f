//! Diagnostic runner for Totem bytecode images.
//!
//! Loads an image, drives the VM to quiescence (or a fault, or the
//! step budget), writes the instruction trace to a side file, and
//! prints instruction statistics plus a final register dump.

use std::fs::File;
use std::io::BufWriter;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Instant;

use clap::Parser;
use log::{error, info};

use totem_vm::{CodeBuf, EventKind, ImageBuilder, ScriptVm, StateDef, TypeTag, VmResult};

mod args;

use args::Args;

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            error!("{error}");
            ExitCode::FAILURE
        }
    }
}

fn run(args: &Args) -> VmResult<()> {
    let mut vm = match &args.image {
        Some(path) => ScriptVm::from_file(path)?,
        None => ScriptVm::new(build_demo_image()?)?,
    };

    let trace_path = trace_path(args);
    vm.set_trace_writer(Box::new(BufWriter::new(File::create(&trace_path)?)));
    info!("writing instruction trace to {}", trace_path.display());

    let started = Instant::now();
    let mut steps = 0u64;
    while steps < args.max_steps && vm.fault().is_none() && !vm.is_idle() {
        vm.step(true, &args.actor);
        steps += 1;
        // The host contract is to wait out SLR in wall-clock time; a
        // diagnostic run just discards it.
        let sleeping = vm.sleep_remaining();
        if sleeping > 0.0 {
            info!("script slept for {sleeping:.3}s");
            vm.reduce_sleep(sleeping);
        }
    }
    let elapsed = started.elapsed().as_secs_f32();

    if let Some(fault) = vm.fault() {
        error!("script faulted: {}", fault.message());
    } else if steps >= args.max_steps {
        error!("step budget of {} exhausted", args.max_steps);
    }

    let executed = vm.instruction_count();
    info!("{executed} instructions in {elapsed} seconds");
    if elapsed > 0.0 {
        info!("{:.1}K instructions per second", executed as f32 / elapsed / 1000.0);
    }
    println!("{}", vm.registers());
    Ok(())
}

fn trace_path(args: &Args) -> PathBuf {
    if let Some(path) = &args.trace_file {
        return path.clone();
    }
    match &args.image {
        Some(image) => image.with_extension("trace"),
        None => PathBuf::from("demo.trace"),
    }
}

/// A small self-contained image: on entry, print some arithmetic and
/// call a default library function.
fn build_demo_image() -> VmResult<Vec<u8>> {
    let mut builder = ImageBuilder::new();

    let mut entry = CodeBuf::new();
    entry
        .push_integer(6)
        .push_integer(7)
        .binary(totem_vm::OpCode::Mul, TypeTag::Integer, TypeTag::Integer)
        .print(TypeTag::Integer);
    entry
        .push_string("Totem")
        .push_string(" VM")
        .binary(totem_vm::OpCode::Add, TypeTag::String, TypeTag::String)
        .print(TypeTag::String);
    entry.begin_lib_call();
    entry.push_string("demo image complete");
    entry.call_library(0); // log_message
    entry.end_handler();

    builder.add_state(StateDef::new().on(EventKind::StateEntry, 64, entry));
    builder.build()
}
