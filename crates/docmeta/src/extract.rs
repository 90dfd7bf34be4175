use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use docmeta_core::registry;
use docmeta_core::{
    AzureOpenAiClient, ClientProvider, Error, ExtractionOutput, ModelClient, PipelineCache,
    Registry, RunOptions, Settings, UnitCache,
};
use serde_json::{json, Map, Value};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::cli::ExtractArgs;
use crate::output;

pub fn builtin_registry() -> Result<Arc<Registry>> {
    Ok(registry::install(Registry::with_builtin_plugins()?))
}

pub fn families() -> Result<Value> {
    let registry = builtin_registry()?;
    Ok(json!(registry.families()))
}

pub async fn run(args: ExtractArgs, pretty: bool) -> Result<ExitCode> {
    let registry = builtin_registry()?;
    if !registry.contains(&args.family) {
        return Err(Error::UnknownFamily(args.family).into());
    }

    let external_fields = parse_meta(&args.meta)?;
    let settings = Arc::new(Settings::from_env()?);
    let language = args
        .language
        .clone()
        .unwrap_or_else(|| settings.default_language.clone());

    let client_settings = Arc::clone(&settings);
    let clients: ClientProvider = Arc::new(
        move |language: &str| -> docmeta_core::Result<Arc<dyn ModelClient>> {
            let config = client_settings.client_config(language)?;
            Ok(Arc::new(AzureOpenAiClient::new(config)?))
        },
    );

    let pipelines = PipelineCache::new(registry, settings, clients)
        .with_unit_cache(Arc::new(UnitCache::new()));
    let pipeline = pipelines.get(&args.family, &language)?;

    let options = RunOptions {
        external_fields,
        timeout: args.timeout.map(Duration::from_secs),
    };

    let semaphore = Arc::new(Semaphore::new(args.jobs.max(1)));
    let mut tasks = JoinSet::new();

    for (index, file) in args.files.into_iter().enumerate() {
        let pipeline = Arc::clone(&pipeline);
        let semaphore = Arc::clone(&semaphore);
        let options = options.clone();

        tasks.spawn(async move {
            let _permit = semaphore.acquire_owned().await.ok();
            let result = pipeline.run_with(&file, options).await;
            (index, file, result)
        });
    }

    let mut outcomes = Vec::with_capacity(tasks.len());
    while let Some(joined) = tasks.join_next().await {
        outcomes.push(joined?);
    }
    outcomes.sort_by_key(|(index, ..)| *index);

    let mut failed = false;
    for (_, file, result) in outcomes {
        let report = match result {
            Ok(extraction) => file_report(&file, extraction, args.annotate)?,
            Err(err) => {
                failed = true;
                tracing::error!(file = %file.display(), error = %err, "Extraction failed");
                json!({
                    "file": file.display().to_string(),
                    "error": output::error_body(err.kind(), &err.to_string()),
                })
            }
        };
        output::print_json(&report, pretty)?;
    }

    Ok(if failed {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    })
}

fn file_report(file: &Path, extraction: ExtractionOutput, annotate: bool) -> Result<Value> {
    let mut report = Map::new();
    report.insert("file".into(), file.display().to_string().into());
    report.insert("metadata".into(), Value::Object(extraction.metadata));
    if annotate {
        report.insert(
            "diagnostics".into(),
            serde_json::to_value(&extraction.diagnostics)?,
        );
    }
    Ok(Value::Object(report))
}

fn parse_meta(pairs: &[String]) -> Result<Map<String, Value>> {
    let mut fields = Map::new();
    for pair in pairs {
        let (key, value) = pair
            .split_once('=')
            .filter(|(key, _)| !key.trim().is_empty())
            .ok_or_else(|| Error::Config(format!("--meta expects KEY=VALUE, got '{pair}'")))?;
        fields.insert(key.trim().to_string(), Value::String(value.to_string()));
    }
    Ok(fields)
}
