#[cfg(target_os = "linux")]
fn main() -> anyhow::Result<()> {
    use std::io::Write;
    use std::path::PathBuf;

    use anyhow::Context;
    use vmm::vstate::VmRunner;
    use vmm::{RunExit, VmConfig};

    tracing_subscriber::fmt::init();

    let mut args = std::env::args().skip(1);
    let config: VmConfig = match args.next().as_deref() {
        Some("--config") => {
            let path = args.next().context("--config needs a path")?;
            let text = std::fs::read_to_string(&path)
                .with_context(|| format!("reading config {path}"))?;
            serde_json::from_str(&text).context("parsing config")?
        }
        Some(binary) => VmConfig {
            mem_size_mib: 128,
            binary: PathBuf::from(binary),
            args: args.collect(),
            env: Vec::new(),
            files: Vec::new(),
        },
        None => anyhow::bail!("usage: vmm <binary> [args...] | vmm --config <config.json>"),
    };

    let mut runner = VmRunner::from_config(&config)?;
    let exit = runner.run()?;
    std::io::stdout().write_all(runner.output())?;

    match exit {
        RunExit::EndRun => Ok(()),
        RunExit::Fault(fault) => {
            eprintln!(
                "guest fault: {:?} rip={:#x} addr={:#x}",
                fault.kind(),
                { fault.faulting_rip },
                { fault.faulting_address },
            );
            std::process::exit(2);
        }
        RunExit::Continue => unreachable!("run loop returned without a terminal exit"),
    }
}

#[cfg(not(target_os = "linux"))]
fn main() {
    eprintln!("this hypervisor requires KVM and only runs on Linux");
    std::process::exit(1);
}
