use super::{json_pretty, App, EXIT_SUCCESS};
use serde::Serialize;

#[derive(Serialize)]
struct ProviderRow {
    name: String,
    use_partition_tables: bool,
    images: usize,
    instances: usize,
    volumes: usize,
}

pub fn run(app: &App) -> Result<u8, String> {
    let mut rows = Vec::new();
    for provider in app.scope()? {
        let context = |e: unikit_provider::ProviderError| format!("{}: {e}", provider.name());
        rows.push(ProviderRow {
            name: provider.name().to_owned(),
            use_partition_tables: provider.config().use_partition_tables,
            images: provider.list_images().map_err(context)?.len(),
            instances: provider.list_instances().map_err(context)?.len(),
            volumes: provider.list_volumes().map_err(context)?.len(),
        });
    }

    if app.json {
        println!("{}", json_pretty(&rows)?);
    } else if rows.is_empty() {
        println!("no providers configured");
    } else {
        println!(
            "{:<16} {:<8} {:<10} {:<8} PARTITIONS",
            "PROVIDER", "IMAGES", "INSTANCES", "VOLUMES"
        );
        for row in &rows {
            println!(
                "{:<16} {:<8} {:<10} {:<8} {}",
                row.name, row.images, row.instances, row.volumes, row.use_partition_tables
            );
        }
    }
    Ok(EXIT_SUCCESS)
}
