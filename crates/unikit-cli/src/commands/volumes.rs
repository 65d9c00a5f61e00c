use super::{json_pretty, with_spinner, App, EXIT_SUCCESS};
use std::path::PathBuf;
use unikit_schema::{CreateVolumeParams, Volume};

pub fn list(app: &App) -> Result<u8, String> {
    let volumes = app.collect(|p| p.list_volumes())?;
    if app.json {
        println!("{}", json_pretty(&volumes)?);
        return Ok(EXIT_SUCCESS);
    }
    if volumes.values().all(Vec::is_empty) {
        println!("no volumes found");
        return Ok(EXIT_SUCCESS);
    }
    println!(
        "{:<12} {:<20} {:<8} {:<24} ID",
        "PROVIDER", "NAME", "SIZE_MB", "ATTACHED_TO"
    );
    for (provider, volumes) in &volumes {
        for volume in volumes {
            println!(
                "{:<12} {:<20} {:<8} {:<24} {}",
                provider,
                volume.name,
                volume.size_mb,
                volume.attachment.as_deref().unwrap_or("-"),
                volume.id
            );
        }
    }
    Ok(EXIT_SUCCESS)
}

pub fn create(
    app: &App,
    name: &str,
    data: Option<PathBuf>,
    size_mb: Option<u64>,
    no_cleanup: bool,
) -> Result<u8, String> {
    let provider = app.target()?;
    let params = CreateVolumeParams {
        name: name.to_owned(),
        image_path: data,
        size_mb,
        no_cleanup,
    };
    let volume: Volume = with_spinner(
        app.json,
        &format!("creating volume {name} on {}…", provider.name()),
        |v: &Volume| format!("created {} ({} MB)", v.name, v.size_mb),
        || provider.create_volume(&params).map_err(|e| e.to_string()),
    )?;
    if app.json {
        println!("{}", json_pretty(&volume)?);
    } else {
        println!("volume id: {}", volume.id);
    }
    Ok(EXIT_SUCCESS)
}

pub fn attach(app: &App, volume: &str, instance: &str, mount_point: &str) -> Result<u8, String> {
    let provider = app.volume_owner(volume)?;
    let target = provider.get_instance(instance).map_err(|e| e.to_string())?;
    provider
        .attach_volume(volume, &target.id, mount_point)
        .map_err(|e| e.to_string())?;
    if !app.json {
        println!("attached {volume} to {} at {mount_point}", target.name);
    }
    Ok(EXIT_SUCCESS)
}

pub fn detach(app: &App, volume: &str) -> Result<u8, String> {
    let provider = app.volume_owner(volume)?;
    provider.detach_volume(volume).map_err(|e| e.to_string())?;
    if !app.json {
        println!("detached {volume}");
    }
    Ok(EXIT_SUCCESS)
}

pub fn delete(app: &App, query: &str, force: bool) -> Result<u8, String> {
    let provider = app.volume_owner(query)?;
    let volume = provider.get_volume(query).map_err(|e| e.to_string())?;
    provider
        .delete_volume(&volume.id, force)
        .map_err(|e| e.to_string())?;
    if app.json {
        println!("{}", json_pretty(&serde_json::json!({ "deleted": volume.id }))?);
    } else {
        println!("deleted volume {} ({})", volume.name, volume.id);
    }
    Ok(EXIT_SUCCESS)
}
