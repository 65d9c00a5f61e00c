use super::{json_pretty, with_spinner, App, EXIT_SUCCESS};
use unikit_schema::{HubConfig, PullImageParams, PushImageParams, RemoteDeleteImageParams};

fn report(app: &App, action: &str, image: &str, hub: &HubConfig) -> Result<(), String> {
    if app.json {
        let payload = serde_json::json!({ "action": action, "image": image, "hub": hub.url });
        println!("{}", json_pretty(&payload)?);
    }
    Ok(())
}

pub fn pull(app: &App, image: &str, hub: &HubConfig, force: bool) -> Result<u8, String> {
    let provider = app.target()?;
    let params = PullImageParams {
        config: hub.clone(),
        image_name: image.to_owned(),
        force,
    };
    with_spinner(
        app.json,
        &format!("pulling {image} into {}…", provider.name()),
        |_| format!("pulled {image}"),
        || provider.pull_image(&params).map_err(|e| e.to_string()),
    )?;
    report(app, "pulled", image, hub)?;
    Ok(EXIT_SUCCESS)
}

pub fn push(app: &App, query: &str, hub: &HubConfig) -> Result<u8, String> {
    let provider = app.image_owner(query)?;
    let image = provider.get_image(query).map_err(|e| e.to_string())?;
    let params = PushImageParams {
        config: hub.clone(),
        image_name: image.name.clone(),
    };
    with_spinner(
        app.json,
        &format!("pushing {} to {}…", image.name, hub.url),
        |_| format!("pushed {}", image.name),
        || provider.push_image(&params).map_err(|e| e.to_string()),
    )?;
    report(app, "pushed", &image.name, hub)?;
    Ok(EXIT_SUCCESS)
}

pub fn remote_delete(app: &App, image: &str, hub: &HubConfig) -> Result<u8, String> {
    let provider = app.target()?;
    let params = RemoteDeleteImageParams {
        config: hub.clone(),
        image_name: image.to_owned(),
    };
    provider
        .remote_delete_image(&params)
        .map_err(|e| e.to_string())?;
    if !app.json {
        println!("deleted {image} from {}", hub.url);
    }
    report(app, "deleted", image, hub)?;
    Ok(EXIT_SUCCESS)
}
