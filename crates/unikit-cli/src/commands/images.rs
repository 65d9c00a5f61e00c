use super::{json_pretty, with_spinner, App, FormatArg, RumpArg, EXIT_SUCCESS};
use std::fs;
use std::path::{Path, PathBuf};
use unikit_provider::{assemble_rump, devices::number_devices, RumpTarget};
use unikit_schema::{Image, RawImage, RunSpec, StageImageParams, StageSpec};

pub struct StageArgs {
    pub name: String,
    pub image: PathBuf,
    pub kernel: Option<PathBuf>,
    pub rump: Option<RumpArg>,
    pub args: String,
    pub mounts: Vec<String>,
    pub env: Vec<String>,
    pub stub: bool,
    pub format: FormatArg,
    pub force: bool,
    pub no_cleanup: bool,
}

pub fn list(app: &App) -> Result<u8, String> {
    let images = app.collect(|p| p.list_images())?;
    if app.json {
        println!("{}", json_pretty(&images)?);
        return Ok(EXIT_SUCCESS);
    }
    if images.values().all(Vec::is_empty) {
        println!("no images found");
        return Ok(EXIT_SUCCESS);
    }
    println!(
        "{:<12} {:<20} {:<8} {:<24} ID",
        "PROVIDER", "NAME", "SIZE_MB", "MOUNT_POINTS"
    );
    for (provider, images) in &images {
        for image in images {
            let mounts: Vec<&str> = image.run_spec.mount_points().collect();
            println!(
                "{:<12} {:<20} {:<8} {:<24} {}",
                provider,
                image.name,
                image.size_mb,
                mounts.join(","),
                image.id
            );
        }
    }
    Ok(EXIT_SUCCESS)
}

pub fn show(app: &App, query: &str) -> Result<u8, String> {
    let provider = app.image_owner(query)?;
    let image = provider.get_image(query).map_err(|e| e.to_string())?;
    if app.json {
        println!("{}", json_pretty(&image)?);
        return Ok(EXIT_SUCCESS);
    }
    println!("id:             {}", image.id);
    println!("name:           {}", image.name);
    println!("provider:       {}", provider.name());
    println!("infrastructure: {}", image.infrastructure);
    println!("size_mb:        {}", image.size_mb);
    println!("created:        {}", image.created);
    if !image.run_spec.compiler.is_empty() {
        println!("compiler:       {}", image.run_spec.compiler);
    }
    if image.run_spec.default_instance_memory > 0 {
        println!("memory_mb:      {}", image.run_spec.default_instance_memory);
    }
    println!("devices:");
    for mapping in &image.run_spec.device_mappings {
        println!("  {:<20} {}", mapping.mount_point, mapping.device_name);
    }
    Ok(EXIT_SUCCESS)
}

/// Lay out a rump boot folder (`boot.img`, `program.bin`, `cmdline`) in
/// `dir` and return the specs the image is staged with.
fn assemble_rump_folder(
    dir: &Path,
    target: RumpTarget,
    args: &StageArgs,
    kernel: &Path,
) -> Result<(PathBuf, RunSpec, StageSpec), String> {
    let rump = assemble_rump(target, &args.args, &args.mounts, &args.env, args.stub)
        .map_err(|e| e.to_string())?;
    let boot = dir.join("boot.img");
    fs::copy(&args.image, &boot)
        .map_err(|e| format!("failed to copy {}: {e}", args.image.display()))?;
    fs::copy(kernel, dir.join("program.bin"))
        .map_err(|e| format!("failed to copy {}: {e}", kernel.display()))?;
    fs::write(dir.join("cmdline"), &rump.cmdline)
        .map_err(|e| format!("failed to write boot descriptor: {e}"))?;
    Ok((boot, rump.run_spec, rump.stage_spec))
}

fn raw_image(args: &StageArgs, scratch: &Path) -> Result<RawImage, String> {
    if let Some(rump) = args.rump {
        let kernel = args
            .kernel
            .as_deref()
            .ok_or("--rump needs the compiled program passed with --kernel")?;
        let (local_image_path, run_spec, stage_spec) =
            assemble_rump_folder(scratch, rump.into(), args, kernel)?;
        return Ok(RawImage {
            local_image_path,
            stage_spec,
            run_spec,
        });
    }

    if args.kernel.is_some() || !args.env.is_empty() || args.stub || !args.args.is_empty() {
        return Err("--kernel, --args, --env and --stub only apply with --rump".to_owned());
    }
    let (device_mappings, _) =
        number_devices(RumpTarget::Qemu, &args.mounts).map_err(|e| e.to_string())?;
    Ok(RawImage {
        local_image_path: args.image.clone(),
        stage_spec: StageSpec {
            image_format: args.format.into(),
            ..StageSpec::default()
        },
        run_spec: RunSpec {
            device_mappings,
            ..RunSpec::default()
        },
    })
}

pub fn stage(app: &App, args: &StageArgs) -> Result<u8, String> {
    let provider = app.target()?;
    let scratch = tempfile::tempdir().map_err(|e| format!("failed to create scratch dir: {e}"))?;
    let params = StageImageParams {
        name: args.name.clone(),
        raw_image: raw_image(args, scratch.path())?,
        force: args.force,
        no_cleanup: args.no_cleanup,
    };

    let image: Image = with_spinner(
        app.json,
        &format!("staging {} on {}…", args.name, provider.name()),
        |image: &Image| format!("staged {} ({} MB)", image.name, image.size_mb),
        || provider.stage(&params).map_err(|e| e.to_string()),
    )?;

    if app.json {
        println!("{}", json_pretty(&image)?);
    } else {
        println!("image id: {}", image.id);
    }
    Ok(EXIT_SUCCESS)
}

pub fn delete(app: &App, query: &str, force: bool) -> Result<u8, String> {
    let provider = app.image_owner(query)?;
    let image = provider.get_image(query).map_err(|e| e.to_string())?;
    provider
        .delete_image(&image.id, force)
        .map_err(|e| e.to_string())?;
    if app.json {
        println!("{}", json_pretty(&serde_json::json!({ "deleted": image.id }))?);
    } else {
        println!("deleted image {} ({})", image.name, image.id);
    }
    Ok(EXIT_SUCCESS)
}
