mod commands;

use clap::{Parser, Subcommand};
use clap_complete::Shell;
use commands::{
    App, FormatArg, RumpArg, EXIT_CONFIG_ERROR, EXIT_FAILURE, EXIT_NOT_FOUND, EXIT_SUCCESS,
};
use std::path::PathBuf;
use std::process::ExitCode;
use unikit_core::{install_signal_handler, DEFAULT_INTERVAL};

#[derive(Debug, Parser)]
#[command(name = "unikit", version, about = "Build-to-run orchestration for unikernels")]
struct Cli {
    /// Path to the daemon configuration (defaults to ~/.unikit/daemon.toml).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Backend to act on when it cannot be inferred from the resource.
    #[arg(short, long, global = true)]
    provider: Option<String>,

    /// Output results as structured JSON.
    #[arg(long, default_value_t = false, global = true)]
    json: bool,

    /// Enable verbose (debug) logging output.
    #[arg(short, long, default_value_t = false, global = true)]
    verbose: bool,

    /// Enable trace-level logging (more detailed than --verbose).
    #[arg(long, default_value_t = false, global = true)]
    trace: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, clap::Args)]
struct HubArgs {
    /// Hub URL (overrides the [hub] section of the config).
    #[arg(long)]
    hub_url: Option<String>,
    #[arg(long)]
    hub_user: Option<String>,
    #[arg(long)]
    hub_pass: Option<String>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// List configured providers.
    Providers,
    /// List images across providers.
    Images,
    /// Show one image.
    Image {
        /// Image name or id.
        image: String,
    },
    /// Stage a compiled image on a provider.
    Stage {
        /// Name of the new image.
        name: String,
        /// Compiled boot disk, or a folder holding boot.img/program.bin/cmdline.
        #[arg(long)]
        image: PathBuf,
        /// Kernel to boot directly; required with --rump.
        #[arg(long)]
        kernel: Option<PathBuf>,
        /// Assemble a rump boot descriptor for this target.
        #[arg(long, value_enum)]
        rump: Option<RumpArg>,
        /// Program arguments baked into the boot descriptor.
        #[arg(long, default_value = "", allow_hyphen_values = true)]
        args: String,
        /// Data mount point the image expects (repeatable).
        #[arg(long = "mount")]
        mounts: Vec<String>,
        /// KEY=VALUE baked into the boot descriptor (repeatable).
        #[arg(long = "env")]
        env: Vec<String>,
        /// Start the instance-listener stub before the program.
        #[arg(long, default_value_t = false)]
        stub: bool,
        #[arg(long, value_enum, default_value_t = FormatArg::Raw)]
        format: FormatArg,
        /// Replace an existing image with the same name.
        #[arg(long, default_value_t = false)]
        force: bool,
        /// Keep partial resources if staging fails.
        #[arg(long, default_value_t = false)]
        no_cleanup: bool,
    },
    /// Delete an image.
    DeleteImage {
        image: String,
        /// Also delete instances running this image.
        #[arg(long, default_value_t = false)]
        force: bool,
    },
    /// Run an instance from an image.
    Run {
        /// Name of the new instance.
        name: String,
        /// Image name or id.
        #[arg(long)]
        image: String,
        /// Volume binding as volumeId:mountPoint (repeatable).
        #[arg(long = "vol")]
        volumes: Vec<String>,
        /// Run-time environment as KEY=VALUE (repeatable).
        #[arg(long = "env")]
        env: Vec<String>,
        /// Memory in MB (defaults to the image's default).
        #[arg(long, default_value_t = 0)]
        memory: u32,
        /// Boot halted and wait for a debugger.
        #[arg(long, default_value_t = false)]
        debug: bool,
        #[arg(long, default_value_t = false)]
        no_cleanup: bool,
    },
    /// List instances across providers.
    Instances,
    /// Start a stopped instance.
    Start { instance: String },
    /// Stop a running instance.
    Stop { instance: String },
    /// Delete an instance.
    DeleteInstance {
        instance: String,
        /// Delete even when running.
        #[arg(long, default_value_t = false)]
        force: bool,
    },
    /// Print an instance's console output.
    Logs { instance: String },
    /// List volumes across providers.
    Volumes,
    /// Create a volume from a data image or as an empty disk.
    CreateVolume {
        name: String,
        /// Raw data image to seed the volume from.
        #[arg(long, conflicts_with = "size")]
        data: Option<PathBuf>,
        /// Size in MB of an empty volume.
        #[arg(long)]
        size: Option<u64>,
        #[arg(long, default_value_t = false)]
        no_cleanup: bool,
    },
    /// Attach a volume to an instance at a mount point.
    AttachVolume {
        volume: String,
        #[arg(long)]
        instance: String,
        #[arg(long)]
        mount: String,
    },
    /// Detach a volume from its instance.
    DetachVolume { volume: String },
    /// Delete a volume.
    DeleteVolume {
        volume: String,
        /// Detach first when attached.
        #[arg(long, default_value_t = false)]
        force: bool,
    },
    /// Pull an image from the hub.
    Pull {
        image: String,
        #[command(flatten)]
        hub: HubArgs,
        /// Replace a local image with the same name.
        #[arg(long, default_value_t = false)]
        force: bool,
    },
    /// Push an image to the hub.
    Push {
        image: String,
        #[command(flatten)]
        hub: HubArgs,
    },
    /// Delete an image from the hub.
    RemoteDelete {
        image: String,
        #[command(flatten)]
        hub: HubArgs,
    },
    /// Keep every provider's ledger reconciled until Ctrl-C.
    Daemon {
        /// Milliseconds between reconciliation passes.
        #[arg(long, default_value_t = DEFAULT_INTERVAL.as_millis() as u64)]
        interval_ms: u64,
    },
    /// Generate shell completions for bash, zsh, fish, elvish, or powershell.
    Completions {
        /// Shell to generate completions for.
        shell: Shell,
    },
    /// Generate man pages in the specified directory.
    ManPages {
        /// Output directory for man pages.
        #[arg(default_value = "man")]
        dir: PathBuf,
    },
}

fn main() -> ExitCode {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        let msg = info.to_string();
        if msg.contains("Broken pipe")
            || msg.contains("broken pipe")
            || msg.contains("os error 32")
            || msg.contains("failed printing to stdout")
        {
            std::process::exit(0);
        }
        default_hook(info);
    }));

    let cli = Cli::parse();

    let default_level = if cli.trace {
        "trace"
    } else if cli.verbose {
        "debug"
    } else {
        "warn"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_env("UNIKIT_LOG")
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_target(false)
        .without_time()
        .with_writer(std::io::stderr)
        .init();

    install_signal_handler();

    match dispatch(cli) {
        Ok(code) => ExitCode::from(code),
        Err(msg) => {
            eprintln!("error: {msg}");
            let code = if msg.starts_with("config error:")
                || msg.starts_with("no provider")
                || msg.contains("pick one with --provider")
            {
                EXIT_CONFIG_ERROR
            } else if msg.ends_with("not found") {
                EXIT_NOT_FOUND
            } else {
                EXIT_FAILURE
            };
            ExitCode::from(code)
        }
    }
}

fn dispatch(cli: Cli) -> Result<u8, String> {
    let Cli {
        config,
        provider,
        json,
        command,
        ..
    } = cli;
    if let Commands::Completions { shell } = command {
        return commands::completions::run::<Cli>(shell);
    }
    if let Commands::ManPages { dir } = &command {
        return commands::man_pages::run::<Cli>(dir);
    }
    let app = &App::load(config.as_deref(), provider, json)?;

    match command {
        Commands::Providers => commands::providers::run(app),
        Commands::Images => commands::images::list(app),
        Commands::Image { image } => commands::images::show(app, &image),
        Commands::Stage {
            name,
            image,
            kernel,
            rump,
            args,
            mounts,
            env,
            stub,
            format,
            force,
            no_cleanup,
        } => commands::images::stage(
            app,
            &commands::images::StageArgs {
                name,
                image,
                kernel,
                rump,
                args,
                mounts,
                env,
                stub,
                format,
                force,
                no_cleanup,
            },
        ),
        Commands::DeleteImage { image, force } => commands::images::delete(app, &image, force),
        Commands::Run {
            name,
            image,
            volumes,
            env,
            memory,
            debug,
            no_cleanup,
        } => commands::instances::run(
            app,
            &commands::instances::RunArgs {
                name,
                image,
                volumes,
                env,
                memory,
                debug,
                no_cleanup,
            },
        ),
        Commands::Instances => commands::instances::list(app),
        Commands::Start { instance } => commands::instances::start(app, &instance),
        Commands::Stop { instance } => commands::instances::stop(app, &instance),
        Commands::DeleteInstance { instance, force } => {
            commands::instances::delete(app, &instance, force)
        }
        Commands::Logs { instance } => commands::instances::logs(app, &instance),
        Commands::Volumes => commands::volumes::list(app),
        Commands::CreateVolume {
            name,
            data,
            size,
            no_cleanup,
        } => commands::volumes::create(app, &name, data, size, no_cleanup),
        Commands::AttachVolume {
            volume,
            instance,
            mount,
        } => commands::volumes::attach(app, &volume, &instance, &mount),
        Commands::DetachVolume { volume } => commands::volumes::detach(app, &volume),
        Commands::DeleteVolume { volume, force } => commands::volumes::delete(app, &volume, force),
        Commands::Pull { image, hub, force } => {
            commands::hub::pull(app, &image, &app.hub_config(hub.into())?, force)
        }
        Commands::Push { image, hub } => {
            commands::hub::push(app, &image, &app.hub_config(hub.into())?)
        }
        Commands::RemoteDelete { image, hub } => {
            commands::hub::remote_delete(app, &image, &app.hub_config(hub.into())?)
        }
        Commands::Daemon { interval_ms } => commands::daemon::run(app, interval_ms),
        Commands::Completions { .. } | Commands::ManPages { .. } => Ok(EXIT_SUCCESS),
    }
}

impl From<HubArgs> for commands::HubOverrides {
    fn from(args: HubArgs) -> Self {
        Self {
            url: args.hub_url,
            user: args.hub_user,
            pass: args.hub_pass,
        }
    }
}
