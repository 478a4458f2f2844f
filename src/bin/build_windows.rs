use std::collections::BTreeMap;
use std::path::PathBuf;

use agriyield::{
    init_logging, log_app_start, log_batch_summary, logging_config_from_env,
    pipeline_config_from_env, window_table_path, write_window_table, CsvRecordStore,
    PipelineConfig, RecordStore, Window,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let logging_cfg = logging_config_from_env();
    init_logging(&logging_cfg)?;
    log_app_start(&logging_cfg, "build_windows");

    let store_root = env_path("AGRIYIELD_STORE_ROOT", "data/records");
    let output_root = env_path("AGRIYIELD_OUTPUT_ROOT", "data/windows");
    let cfg = match std::env::var("AGRIYIELD_CONFIG") {
        Ok(path) => PipelineConfig::load_json(&PathBuf::from(path))?,
        Err(_) => pipeline_config_from_env(),
    };

    let store = std::sync::Arc::new(CsvRecordStore::new(&store_root));
    let groups = store.list_groups()?;
    println!(
        "Building windows for {} season groups from {}",
        groups.len(),
        store_root.display()
    );

    let output = agriyield::run_batch_concurrent(store, &groups, &cfg).await?;
    log_batch_summary(&output.report);

    // Keyed by target file so two groups can never overwrite each other.
    let mut by_table: BTreeMap<PathBuf, Vec<Window>> = BTreeMap::new();
    for window in output.windows {
        match window_table_path(&output_root, &window.key.farm_id, &window.key.crop) {
            Ok(path) => by_table.entry(path).or_default().push(window),
            Err(err) => println!("  SKIPPED {}: {err}", window.key),
        }
    }
    for windows in by_table.values() {
        let key = &windows[0].key;
        let path = write_window_table(&output_root, &key.farm_id, &key.crop, windows)?;
        println!("  {}/{}: {} windows -> {}", key.farm_id, key.crop, windows.len(), path.display());
    }

    if let Some(scalers) = &output.scalers {
        let path = output_root.join("scalers.json");
        scalers.save_json(&path)?;
        println!("Fitted scalers -> {}", path.display());
    }

    let report = &output.report;
    println!(
        "\nSummary: total={} processed={} skipped={} failed={} examples={}",
        report.groups_total,
        report.groups_processed,
        report.groups_skipped,
        report.groups_failed,
        report.examples
    );
    for failure in &report.failures {
        println!("  FAILED {} [{:?}] {}", failure.key, failure.stage, failure.reason);
    }
    for score in output.importance.iter().filter(|s| s.percent >= 1.0) {
        println!("  importance {:<32} {:>6.2}%", score.column, score.percent);
    }

    Ok(())
}

fn env_path(key: &str, default: &str) -> PathBuf {
    std::env::var(key)
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(default))
}
