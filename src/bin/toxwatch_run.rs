use std::path::PathBuf;
use std::time::Instant;

use toxwatch::{
    init_logging, log_app_start, log_config_loaded, log_run_finish, logging_config_from_env,
    run_pipeline, PipelineConfig,
};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let logging_cfg = logging_config_from_env();
    init_logging(&logging_cfg)?;
    log_app_start(&logging_cfg);

    let config_path: Option<PathBuf> = std::env::args_os()
        .nth(1)
        .map(PathBuf::from)
        .or_else(|| std::env::var_os("TOXWATCH_CONFIG").map(PathBuf::from));

    let mut cfg = match &config_path {
        Some(path) => PipelineConfig::from_json_file(path)?,
        None => PipelineConfig::default(),
    };
    cfg.apply_env_overrides()?;
    cfg.validate()?;
    log_config_loaded(
        config_path.as_deref(),
        &cfg.target,
        cfg.ensemble.folds,
        cfg.ensemble.vote_cutoff,
    );

    let started = Instant::now();
    let report = run_pipeline(&cfg)?;
    log_run_finish(
        &cfg.output_dir,
        started.elapsed().as_millis() as u64,
        report.latency.events,
    );

    println!(
        "{}: {} calibration rows, TP={} FP={} TN={} FN={}, {} events ({} detected, {} missed)",
        report.target,
        report.score.rows,
        report.score.true_positives,
        report.score.false_positives,
        report.score.true_negatives,
        report.score.false_negatives,
        report.latency.events,
        report.latency.detected,
        report.latency.missed
    );
    println!("outputs written to {}", cfg.output_dir.display());

    Ok(())
}
