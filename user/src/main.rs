use std::{
    path::PathBuf,
    process::ExitCode,
    sync::{Arc, Mutex},
    time::Duration,
};

use clap::Parser;
use kernel::{boot, Image, KernelConfig, KernelError, Pid, VirtAddr};
use log::LevelFilter;

const SERVER: VirtAddr = VirtAddr::new(0x80_0000);
const CLIENT: VirtAddr = VirtAddr::new(0x80_1000);

/// Boots the kernel with a client/server init program: every client sends
/// one integer to the server, which receives them in arrival order.
#[derive(Parser, Debug)]
#[command(name = "user", version, about)]
struct Cli {
    /// Number of cores to bring up.
    #[arg(long, default_value_t = 2)]
    cpus: usize,

    /// Number of client processes forked by the server.
    #[arg(long, default_value_t = 4)]
    clients: u64,

    /// Console log level.
    #[arg(long, default_value = "info")]
    log_level: LevelFilter,

    /// Kernel configuration file (TOML); flags override it.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Seconds to wait for the program to finish.
    #[arg(long, default_value_t = 10)]
    timeout: u64,
}

fn config(cli: &Cli) -> Result<KernelConfig, KernelError> {
    let mut config = match &cli.config {
        Some(path) => {
            let text = std::fs::read_to_string(path).map_err(|err| {
                KernelError::InvalidConfig(format!("{}: {}", path.display(), err))
            })?;
            KernelConfig::from_toml(&text)?
        }
        None => KernelConfig::default(),
    };
    config.ncpu = cli.cpus;
    config.log_level = cli.log_level;
    config.validate()?;
    Ok(config)
}

fn image(clients: u64, received: Arc<Mutex<Vec<(Pid, u64)>>>) -> Image {
    Image::new(SERVER)
        .routine(SERVER, move |ctx| {
            let me = ctx.getpid();
            for index in 0..clients {
                ctx.modify_trap_frame(|tf| {
                    tf.rbx = me.as_raw();
                    tf.rcx = index;
                });
                if ctx.fork(CLIENT).is_none() {
                    log::error!("server: fork of client {} failed", index);
                    return;
                }
            }
            for _ in 0..clients {
                let message = ctx.recvi();
                if let Ok(mut received) = received.lock() {
                    received.push(message);
                }
            }
        })
        .routine(CLIENT, |ctx| {
            let tf = ctx.trap_frame();
            let server = Pid::from_raw(tf.rbx);
            let value = tf.rcx * tf.rcx;
            log::info!("client {:?}: sending {} on cpu{}", ctx.getpid(), value, ctx.cpu());
            ctx.sendi(server, value);
        })
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let config = match config(&cli) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("user: {}", err);
            return ExitCode::FAILURE;
        }
    };

    let received = Arc::new(Mutex::new(Vec::new()));
    let mut machine = match boot(config, &image(cli.clients, received.clone())) {
        Ok(machine) => machine,
        Err(err) => {
            eprintln!("user: boot failed: {}", err);
            return ExitCode::FAILURE;
        }
    };

    let init = machine.init_pid();
    let finished = machine.wait_until(Duration::from_secs(cli.timeout), |m| {
        let snapshot = m.snapshot();
        snapshot.zombies.contains(&init) && snapshot.ready.is_empty()
    });

    if let Ok(received) = received.lock() {
        for (sender, value) in received.iter() {
            println!("served {:?}: {}", sender, value);
        }
    }
    println!("{}", machine.stat());
    let fault = machine.fault();
    machine.shutdown();

    match (finished, fault) {
        (_, Some(fault)) => {
            eprintln!("user: machine fault: {}", fault);
            ExitCode::FAILURE
        }
        (false, None) => {
            eprintln!("user: timed out after {}s", cli.timeout);
            ExitCode::FAILURE
        }
        (true, None) => ExitCode::SUCCESS,
    }
}
