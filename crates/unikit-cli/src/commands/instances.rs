use super::{colorize_state, json_pretty, with_spinner, App, EXIT_SUCCESS};
use unikit_schema::{parse_env_pairs, parse_volume_bindings, Instance, RunInstanceParams};

pub struct RunArgs {
    pub name: String,
    pub image: String,
    pub volumes: Vec<String>,
    pub env: Vec<String>,
    pub memory: u32,
    pub debug: bool,
    pub no_cleanup: bool,
}

impl RunArgs {
    fn params(&self) -> Result<RunInstanceParams, String> {
        Ok(RunInstanceParams {
            name: self.name.clone(),
            image_id: self.image.clone(),
            mount_points_to_volume_ids: parse_volume_bindings(&self.volumes)
                .map_err(|e| e.to_string())?,
            env: parse_env_pairs(&self.env).map_err(|e| e.to_string())?,
            instance_memory: self.memory,
            no_cleanup: self.no_cleanup,
            debug_mode: self.debug,
        })
    }
}

pub fn run(app: &App, args: &RunArgs) -> Result<u8, String> {
    let params = args.params()?;
    let provider = app.image_owner(&args.image)?;

    let instance: Instance = with_spinner(
        app.json,
        &format!("starting {} on {}…", args.name, provider.name()),
        |i: &Instance| format!("{} is {}", i.name, i.state),
        || provider.run_instance(&params).map_err(|e| e.to_string()),
    )?;

    if app.json {
        println!("{}", json_pretty(&instance)?);
    } else {
        println!("instance id: {}", instance.id);
        if !instance.ip_address.is_empty() {
            println!("ip address:  {}", instance.ip_address);
        }
    }
    Ok(EXIT_SUCCESS)
}

pub fn list(app: &App) -> Result<u8, String> {
    let instances = app.collect(|p| p.list_instances())?;
    if app.json {
        println!("{}", json_pretty(&instances)?);
        return Ok(EXIT_SUCCESS);
    }
    if instances.values().all(Vec::is_empty) {
        println!("no instances found");
        return Ok(EXIT_SUCCESS);
    }
    println!(
        "{:<12} {:<20} {:<11} {:<16} {:<20} ID",
        "PROVIDER", "NAME", "STATE", "IP", "IMAGE"
    );
    for (provider, instances) in &instances {
        for instance in instances {
            let state = instance.state.to_string();
            // Pad before colorizing; escape codes throw off the width.
            let state = colorize_state(&format!("{state:<11}"));
            println!(
                "{:<12} {:<20} {} {:<16} {:<20} {}",
                provider, instance.name, state, instance.ip_address, instance.image_id, instance.id
            );
        }
    }
    Ok(EXIT_SUCCESS)
}

pub fn start(app: &App, query: &str) -> Result<u8, String> {
    let provider = app.instance_owner(query)?;
    with_spinner(
        app.json,
        &format!("starting {query}…"),
        |_| format!("started {query}"),
        || provider.start_instance(query).map_err(|e| e.to_string()),
    )?;
    Ok(EXIT_SUCCESS)
}

pub fn stop(app: &App, query: &str) -> Result<u8, String> {
    let provider = app.instance_owner(query)?;
    with_spinner(
        app.json,
        &format!("stopping {query}…"),
        |_| format!("stopped {query}"),
        || provider.stop_instance(query).map_err(|e| e.to_string()),
    )?;
    Ok(EXIT_SUCCESS)
}

pub fn delete(app: &App, query: &str, force: bool) -> Result<u8, String> {
    let provider = app.instance_owner(query)?;
    let instance = provider.get_instance(query).map_err(|e| e.to_string())?;
    provider
        .delete_instance(&instance.id, force)
        .map_err(|e| e.to_string())?;
    if app.json {
        println!("{}", json_pretty(&serde_json::json!({ "deleted": instance.id }))?);
    } else {
        println!("deleted instance {} ({})", instance.name, instance.id);
    }
    Ok(EXIT_SUCCESS)
}

pub fn logs(app: &App, query: &str) -> Result<u8, String> {
    let provider = app.instance_owner(query)?;
    let logs = provider
        .get_instance_logs(query)
        .map_err(|e| e.to_string())?;
    if app.json {
        println!("{}", json_pretty(&serde_json::json!({ "logs": logs }))?);
    } else {
        print!("{logs}");
    }
    Ok(EXIT_SUCCESS)
}
