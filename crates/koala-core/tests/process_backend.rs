//! End-to-end runs through the process backend.
//!
//! Each test returns early when the host has no `python3`, or none with
//! pandas, numpy and matplotlib installed where the test needs them.

use koala_core::executors::ProcessBackend;
use koala_core::harness::Harness;
use koala_core::marshal::ResultMarshaller;
use koala_core::staging::{DatasetStager, StagedSession, HARNESS_FILE};
use koala_core::{
    BackendPreference, ColumnSchema, DataValue, DatasetBinding, DatasetFormat, ExecutionEngine,
    ExecutionRequest, ExecutionResult, HarnessSettings, IsolationBackend, KoalaConfig,
    LimitOverrides, LimitSettings, ProcessSettings, ResourceKind, ResourceLimits,
    StagingSettings, TypedValue, ValidatorSettings,
};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

fn analysis_python_available() -> bool {
    std::process::Command::new("python3")
        .args(["-c", "import pandas, numpy, matplotlib"])
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status()
        .map(|status| status.success())
        .unwrap_or(false)
}

async fn engine() -> Option<ExecutionEngine> {
    if !analysis_python_available() {
        eprintln!("skipping: python3 with pandas, numpy and matplotlib not found");
        return None;
    }
    let mut config = KoalaConfig::default();
    config.engine.backend = BackendPreference::Process;
    config.limits.timeout_seconds = 20;
    Some(ExecutionEngine::from_config(config).await.unwrap())
}

fn scalar(result: &ExecutionResult, name: &str) -> Option<DataValue> {
    result.outputs().iter().find(|o| o.name == name).and_then(|o| match &o.value {
        TypedValue::Scalar { value } => Some(value.clone()),
        _ => None,
    })
}

#[tokio::test]
async fn test_simple_scalar_result() {
    let Some(engine) = engine().await else { return };
    let result = engine.execute(&ExecutionRequest::new("result = 2 + 2")).await.unwrap();
    assert!(result.is_success(), "{:?}", result);
    assert_eq!(result.outputs().len(), 1);
    assert_eq!(scalar(&result, "result"), Some(DataValue::Int(4)));
}

#[tokio::test]
async fn test_dataset_binding_and_table_output() {
    let Some(engine) = engine().await else { return };
    let csv = b"region,revenue\nnorth,10\nsouth,32\nnorth,5\n".to_vec();
    let request = ExecutionRequest::new(
        "print('rows', len(sales))\nresult = sales.groupby('region')['revenue'].sum()\nresult_total = int(sales.revenue.sum())",
    )
    .with_dataset(DatasetBinding::from_bytes("sales", csv, DatasetFormat::Csv));

    let result = engine.execute(&request).await.unwrap();
    match &result {
        ExecutionResult::Success {
            outputs,
            stdout_text,
            ..
        } => {
            assert_eq!(stdout_text, "rows 3\n");
            assert_eq!(outputs[0].name, "result");
            match &outputs[0].value {
                TypedValue::Table { columns, rows, .. } => {
                    assert_eq!(columns, &vec!["region".to_string(), "revenue".to_string()]);
                    assert_eq!(rows[0], vec![DataValue::from("north"), DataValue::Int(15)]);
                }
                other => panic!("expected a table, got {:?}", other),
            }
            assert_eq!(scalar(&result, "result_total"), Some(DataValue::Int(47)));
        }
        other => panic!("unexpected {:?}", other),
    }
}

#[tokio::test]
async fn test_final_expression_is_captured() {
    let Some(engine) = engine().await else { return };
    let result = engine.execute(&ExecutionRequest::new("x = 6\nx * 7")).await.unwrap();
    assert_eq!(scalar(&result, "_"), Some(DataValue::Int(42)));
}

#[tokio::test]
async fn test_runs_are_deterministic() {
    let Some(engine) = engine().await else { return };
    let request = ExecutionRequest::new("result = pd.DataFrame({'a': [3, 1, 2]}).sort_values('a')")
        .with_dataset(DatasetBinding::from_bytes("t", b"k\n1\n".to_vec(), DatasetFormat::Csv));
    let first = engine.execute(&request).await.unwrap();
    let second = engine.execute(&request).await.unwrap();
    assert!(first.is_success());
    assert_eq!(
        serde_json::to_vec(first.outputs()).unwrap(),
        serde_json::to_vec(second.outputs()).unwrap()
    );
}

#[tokio::test]
async fn test_non_finite_values_use_the_sentinel() {
    let Some(engine) = engine().await else { return };
    let result = engine
        .execute(&ExecutionRequest::new("result = float('nan')\nresult_inf = -float('inf')"))
        .await
        .unwrap();
    assert!(matches!(scalar(&result, "result"), Some(DataValue::Float(f)) if f.is_nan()));
    assert_eq!(scalar(&result, "result_inf"), Some(DataValue::Float(f64::NEG_INFINITY)));
    let encoded = serde_json::to_string(&result).unwrap();
    assert!(encoded.contains("{\"$nonfinite\":\"NaN\"}"));
}

#[tokio::test]
async fn test_script_exception_is_a_runtime_failure() {
    let Some(engine) = engine().await else { return };
    let result = engine.execute(&ExecutionRequest::new("x = 1\ny = x / 0")).await.unwrap();
    match result {
        ExecutionResult::RuntimeFailure {
            error_kind, trace, ..
        } => {
            assert_eq!(error_kind, "ZeroDivisionError");
            assert!(trace.contains("analysis.py"));
            assert!(!trace.contains("harness.py"));
        }
        other => panic!("unexpected {:?}", other),
    }
}

#[tokio::test]
async fn test_declared_columns_are_checked() {
    let Some(engine) = engine().await else { return };
    let request = ExecutionRequest::new("result = sales.shape").with_dataset(
        DatasetBinding::from_bytes("sales", b"a,b\n1,2\n".to_vec(), DatasetFormat::Csv).with_columns(vec![
            ColumnSchema {
                name: "revenue".to_string(),
                dtype: None,
            },
        ]),
    );
    match engine.execute(&request).await.unwrap() {
        ExecutionResult::RuntimeFailure { error_kind, message, .. } => {
            assert_eq!(error_kind, "SchemaMismatch");
            assert!(message.contains("revenue"));
        }
        other => panic!("unexpected {:?}", other),
    }
}

#[tokio::test]
async fn test_allow_listed_imports_run() {
    let Some(engine) = engine().await else { return };
    let result = engine
        .execute(&ExecutionRequest::new("import json\nfrom collections import Counter\nresult = json.dumps(Counter('aab'))"))
        .await
        .unwrap();
    assert!(result.is_success(), "{:?}", result);
}

#[tokio::test]
async fn test_plots_are_captured_as_png() {
    let Some(engine) = engine().await else { return };
    let result = engine
        .execute(&ExecutionRequest::new("plt.plot([1, 2, 3], [4, 1, 9])\nplt.title('trend')"))
        .await
        .unwrap();
    let image = result
        .outputs()
        .iter()
        .find_map(|o| match &o.value {
            TypedValue::Image { encoded_bytes, mime } => Some((encoded_bytes.clone(), mime.clone())),
            _ => None,
        })
        .expect("a captured figure");
    assert_eq!(image.1, "image/png");
    assert_eq!(&image.0[..4], b"\x89PNG");
}

#[tokio::test]
async fn test_busy_loop_times_out() {
    let Some(engine) = engine().await else { return };
    let request = ExecutionRequest::new("while True:\n    pass").with_limits(LimitOverrides {
        timeout_seconds: Some(3),
        ..LimitOverrides::default()
    });
    let started = Instant::now();
    let result = engine.execute(&request).await.unwrap();
    assert_eq!(
        result,
        ExecutionResult::ResourceExceeded {
            kind: ResourceKind::Timeout
        }
    );
    assert!(started.elapsed() < Duration::from_secs(3 + 3));
}

#[tokio::test]
async fn test_memory_ceiling() {
    let Some(engine) = engine().await else { return };
    let request = ExecutionRequest::new("block = bytearray(4 * 1024 * 1024 * 1024)\nresult = len(block)");
    let result = engine.execute(&request).await.unwrap();
    assert_eq!(
        result,
        ExecutionResult::ResourceExceeded {
            kind: ResourceKind::Memory
        }
    );
}

/// Stage a session and install the harness without screening the script.
async fn unscreened_session(script: &str, validator: &ValidatorSettings) -> StagedSession {
    let stager = DatasetStager::new(StagingSettings::default());
    let session = stager.stage(&ExecutionRequest::new(script)).await.unwrap();
    Harness::new(HarnessSettings::default(), validator)
        .install(&session)
        .await
        .unwrap();
    session
}

/// Whether `pid` is still running; zombies and missing entries count as gone.
fn process_running(pid: u32) -> bool {
    let Ok(stat) = std::fs::read_to_string(format!("/proc/{}/stat", pid)) else {
        return false;
    };
    let state = stat
        .rfind(')')
        .and_then(|end| stat[end + 1..].trim_start().chars().next());
    !matches!(state, Some('Z') | Some('X') | None)
}

/// The host's hard RLIMIT_NPROC, so the session may fork without raising it.
fn process_ceiling() -> u64 {
    let mut limit = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    // SAFETY: getrlimit only writes the struct passed in.
    if unsafe { libc::getrlimit(libc::RLIMIT_NPROC, &mut limit) } != 0 {
        return 1;
    }
    limit.rlim_max as u64
}

#[tokio::test]
async fn test_background_children_die_with_the_session() {
    let Ok(backend) = ProcessBackend::new(&ProcessSettings::default()) else {
        return;
    };
    let session = unscreened_session("result = 1", &ValidatorSettings::default()).await;
    // a harness that leaves a sleeper behind in its process group and exits cleanly
    std::fs::write(
        session.path(HARNESS_FILE),
        "import subprocess, sys\n\
         child = subprocess.Popen([sys.executable, '-c', 'import time; time.sleep(300)'])\n\
         with open('child.pid', 'w') as fh:\n    fh.write(str(child.pid))\n",
    )
    .unwrap();
    let limits = ResourceLimits {
        max_processes: process_ceiling(),
        ..ResourceLimits::from_settings(&LimitSettings::default())
    };

    backend
        .run(&session, &limits, &CancellationToken::new())
        .await
        .unwrap();

    let pid: u32 = std::fs::read_to_string(session.path("child.pid"))
        .unwrap()
        .trim()
        .parse()
        .unwrap();
    let deadline = Instant::now() + Duration::from_secs(3);
    while process_running(pid) {
        assert!(Instant::now() < deadline, "child {} outlived its session", pid);
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    session.close();
}

#[tokio::test]
async fn test_os_process_control_is_stubbed_at_runtime() {
    if !analysis_python_available() {
        return;
    }
    let backend = ProcessBackend::new(&ProcessSettings::default()).unwrap();
    // let the harness import `operator` so only the runtime stubs stand in the way
    let mut validator = ValidatorSettings::default();
    validator.allowed_modules.push("operator".to_string());
    let session = unscreened_session(
        "import operator\nm = operator.attrgetter('io.common.os')(pd)\nresult = operator.methodcaller('system', 'true')(m)",
        &validator,
    )
    .await;
    let limits = ResourceLimits::from_settings(&LimitSettings::default());

    let raw = backend
        .run(&session, &limits, &CancellationToken::new())
        .await
        .unwrap();
    match ResultMarshaller::new(&HarnessSettings::default()).marshal(&raw) {
        ExecutionResult::RuntimeFailure { error_kind, message, .. } => {
            assert_eq!(error_kind, "PermissionError");
            assert!(message.contains("process control"));
        }
        other => panic!("unexpected {:?}", other),
    }
    session.close();
}

#[tokio::test]
async fn test_dataset_that_does_not_fit_in_memory() {
    let Some(engine) = engine().await else { return };
    // ~40 MiB on disk, well over the 512 MiB ceiling once parsed into records
    let mut records = Vec::with_capacity(41 * 1024 * 1024);
    records.push(b'[');
    for i in 0..5_000_000 {
        if i > 0 {
            records.push(b',');
        }
        records.extend_from_slice(b"{\"a\":1}");
    }
    records.push(b']');
    let request = ExecutionRequest::new("result = len(events)")
        .with_dataset(DatasetBinding::from_bytes("events", records, DatasetFormat::Json));

    let result = engine.execute(&request).await.unwrap();
    assert_eq!(
        result,
        ExecutionResult::ResourceExceeded {
            kind: ResourceKind::Memory
        }
    );
}

#[tokio::test]
async fn test_oversized_figure_leaves_a_note() {
    if !analysis_python_available() {
        return;
    }
    let mut config = KoalaConfig::default();
    config.engine.backend = BackendPreference::Process;
    config.harness.max_image_bytes = 64;
    let engine = ExecutionEngine::from_config(config).await.unwrap();

    let result = engine
        .execute(&ExecutionRequest::new("plt.plot([1, 2, 3], [4, 1, 9])"))
        .await
        .unwrap();
    assert!(result.is_success(), "{:?}", result);
    let figure = result
        .outputs()
        .iter()
        .find(|o| o.name == "figure_1")
        .expect("a note in place of the figure");
    match &figure.value {
        TypedValue::Text { value, truncated } => {
            assert!(value.contains("omitted"));
            assert!(*truncated);
        }
        other => panic!("unexpected {:?}", other),
    }
}
