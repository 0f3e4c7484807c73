use anyhow::anyhow;
use colored::Colorize;
use simpple_gpu::{AccessEvent, GpuConfig, GpuDevice, MmioManager, SimppleError};
use std::sync::{Arc, Mutex};

const GPU_BAR: u8 = 0;
const GPU_REGION_SIZE: u64 = 1024 * 1024; // 1 MiB of device memory

#[derive(Debug, Clone, Copy)]
enum Access {
    Read { offset: u64, size: usize },
    Write { offset: u64, size: usize, value: u64 },
}

// What a driver poking at the BAR might do, including a few accesses the device
// has to reject.
const SCRIPT: &[Access] = &[
    Access::Write { offset: 0x10, size: 1, value: 0xFF },
    Access::Read { offset: 0x10, size: 1 },
    Access::Write { offset: 0x20, size: 4, value: 0xDEAD_BEEF },
    Access::Read { offset: 0x20, size: 4 },
    Access::Read { offset: 0x20, size: 8 },
    Access::Write { offset: GPU_REGION_SIZE - 1, size: 1, value: 0x42 },
    Access::Read { offset: GPU_REGION_SIZE - 1, size: 1 },
    Access::Write { offset: GPU_REGION_SIZE, size: 1, value: 0x42 },
    Access::Read { offset: GPU_REGION_SIZE, size: 1 },
    Access::Read { offset: 0x30, size: 3 },
];

fn run() -> Result<(), SimppleError> {
    env_logger::init();

    let mut bus = MmioManager::default();
    let handle = bus.allocate_handle()?;
    let config = GpuConfig {
        bar_index: GPU_BAR,
        region_size: Some(GPU_REGION_SIZE),
        ..GpuConfig::default()
    };

    let mut gpu = GpuDevice::new(handle, config)?;
    let events = Arc::new(Mutex::new(Vec::new()));
    let events_clone = events.clone();
    gpu.set_access_handler(move |event: &AccessEvent| {
        if let Ok(mut events) = events_clone.lock() {
            events.push(*event);
        }
    });

    // Nothing is mapped yet, so this must bounce.
    if let Err(err) = gpu.on_read(0x10, 1) {
        println!("{} {err}", "before realize:".bright_black());
    }

    gpu.on_realize(&mut bus)?;
    let region = *gpu
        .region()
        .ok_or_else(|| anyhow!("GPU realized without a memory BAR"))?;

    let identity = gpu.identity();
    println!(
        "{} {:04x}:{:04x} class {:04x}, BAR{} = {:#010x} ({} KiB)",
        identity.type_name.bright_cyan().bold(),
        identity.vendor_id,
        identity.device_id,
        identity.class_id,
        region.bar_index,
        region.bar_register().raw(),
        region.size / 1024
    );

    for access in SCRIPT {
        match *access {
            Access::Read { offset, size } => {
                let addr = region.base + offset;
                match bus.handle_read(addr, size) {
                    Ok(value) => println!(
                        "{} {size}B @ {offset:#07x} = {}",
                        "read ".green(),
                        format!("{value:#x}").bright_white()
                    ),
                    Err(err) => println!(
                        "{} {size}B @ {offset:#07x} -> {} ({err})",
                        "read ".red(),
                        format!("{:#x}", bus.bus_read(addr, size)).bright_red()
                    ),
                }
            }
            Access::Write {
                offset,
                size,
                value,
            } => {
                let addr = region.base + offset;
                match bus.handle_write(addr, size, value) {
                    Ok(()) => println!(
                        "{} {size}B @ {offset:#07x} <- {value:#x}",
                        "write".yellow()
                    ),
                    Err(err) => println!(
                        "{} {size}B @ {offset:#07x} <- {value:#x} dropped ({err})",
                        "write".red()
                    ),
                }
            }
        }
    }

    let committed = events.lock().map(|events| events.len()).unwrap_or(0);
    println!(
        "{}",
        format!("{committed} accesses reached the register file").bright_black()
    );

    gpu.on_uninit(&mut bus)?;
    Ok(())
}

fn main() {
    match run() {
        Ok(()) => {}
        Err(e) => {
            eprintln!("{e}");
        }
    }
}
