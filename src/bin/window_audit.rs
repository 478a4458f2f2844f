use std::fs;
use std::path::{Path, PathBuf};

use agriyield::{
    build_all, init_logging, log_app_start, logging_config_from_env, read_window_table,
    WindowTable,
};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let logging_cfg = logging_config_from_env();
    init_logging(&logging_cfg)?;
    log_app_start(&logging_cfg, "window_audit");

    let root = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("AGRIYIELD_OUTPUT_ROOT").ok())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("data/windows"));

    let tables = find_window_tables(&root)?;
    println!("Auditing {} window tables under {}", tables.len(), root.display());

    let mut rejected_total = 0usize;
    for path in &tables {
        let windows = read_window_table(path)?;
        // Only numbering and label placement are audited; raw cells may be empty.
        let mut table = WindowTable::from_windows(&windows);
        table.columns.clear();
        for row in &mut table.rows {
            row.values.clear();
        }
        let batch = build_all(&table);
        println!(
            "  {} | windows={} groups={} labeled={} unlabeled={} rejected={}",
            path.display(),
            windows.len(),
            batch.report.groups_total,
            batch.report.groups_used,
            batch.report.groups_unlabeled,
            batch.report.rejected.len()
        );
        for rejected in &batch.report.rejected {
            println!("    REJECTED {}: {}", rejected.key, rejected.reason);
        }
        rejected_total += batch.report.rejected.len();
    }

    if rejected_total > 0 {
        return Err(format!("{rejected_total} season groups failed the window audit").into());
    }
    println!("All season groups passed.");
    Ok(())
}

/// `{root}/{farm}/crops/{crop}/{crop}.csv`
fn find_window_tables(root: &Path) -> Result<Vec<PathBuf>, Box<dyn std::error::Error>> {
    let mut found = Vec::new();
    for farm in fs::read_dir(root)? {
        let crops_dir = farm?.path().join("crops");
        if !crops_dir.is_dir() {
            continue;
        }
        for crop in fs::read_dir(&crops_dir)? {
            let crop_dir = crop?.path();
            let Some(name) = crop_dir.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let table = crop_dir.join(format!("{name}.csv"));
            if table.is_file() {
                found.push(table);
            }
        }
    }
    found.sort();
    Ok(found)
}
