//! Test helpers: an in-process fake image-generation server and a fake raster tool

#![allow(dead_code)]

use axum::extract::{Multipart, Path, Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

use arcade_memorial::models::events::PipelineEvent;
use arcade_memorial::services::composition::CompositionBuilder;
use arcade_memorial::services::executor::CommandExecutor;
use arcade_memorial::services::memorial_card::MemorialCardService;

use crate::fixtures::{tiny_png, CardAssets};

/// Fake tool: writes a card to the script's `-write` target and logs the run
/// next to the script.
pub const FAKE_MAGICK_OK: &str = r#"out=$(sed -n 's/^-write "\(.*\)"$/\1/p' "$2")
echo run >> "$(dirname "$2")/tool_runs.log"
printf 'card' > "$out""#;

pub const FAKE_MAGICK_MISSING_FILE: &str =
    r#"echo "magick: unable to open image '/gone.png': No such file or directory" >&2; exit 1"#;

/// Fake tool that exits cleanly without writing anything.
pub const FAKE_MAGICK_SILENT: &str = "exit 0";

/// Executor running `script` through `sh -c`; `$1` is `-script`, `$2` the script path.
pub fn fake_magick(script: &str, timeout: Duration) -> CommandExecutor {
    CommandExecutor::new("sh", timeout).with_base_args(["-c", script, "fake-magick"])
}

pub fn card_service(assets: &CardAssets, script: &str) -> MemorialCardService {
    MemorialCardService::new(
        CompositionBuilder::new(&assets.backgrounds_dir, &assets.font_path),
        fake_magick(script, Duration::from_secs(5)),
    )
}

/// Receive events until one matches `predicate`; panics after `timeout`.
pub async fn wait_for_event<F>(
    events: &mut broadcast::Receiver<PipelineEvent>,
    timeout: Duration,
    predicate: F,
) -> PipelineEvent
where
    F: Fn(&PipelineEvent) -> bool,
{
    tokio::time::timeout(timeout, async {
        loop {
            match events.recv().await {
                Ok(event) if predicate(&event) => return event,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("event stream closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

/// Poll `condition` every 20ms until it holds; panics after `timeout`.
pub async fn wait_until<F>(timeout: Duration, condition: F)
where
    F: Fn() -> bool,
{
    tokio::time::timeout(timeout, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("condition not reached in time")
}

#[derive(Default)]
struct FakeState {
    calls: Mutex<Vec<String>>,
    prompts: Mutex<Vec<(String, Value)>>,
    deleted: Mutex<Vec<String>>,
    hold: AtomicBool,
    fail_execution: AtomicBool,
    counter: AtomicUsize,
}

impl FakeState {
    fn record(&self, call: &str) {
        self.calls.lock().push(call.to_string());
    }

    fn live_prompts(&self) -> Vec<String> {
        let deleted = self.deleted.lock().clone();
        self.prompts
            .lock()
            .iter()
            .map(|(id, _)| id.clone())
            .filter(|id| !deleted.contains(id))
            .collect()
    }
}

/// Handle to a running fake image-generation server.
#[derive(Clone)]
pub struct FakeComfy {
    pub base_url: String,
    state: Arc<FakeState>,
}

impl FakeComfy {
    /// Keep every prompt "running" until released.
    pub fn hold_jobs(&self, hold: bool) {
        self.state.hold.store(hold, Ordering::SeqCst);
    }

    /// Report finished prompts with an error status.
    pub fn fail_execution(&self, fail: bool) {
        self.state.fail_execution.store(fail, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.calls.lock().clone()
    }

    pub fn call_count(&self, call: &str) -> usize {
        self.state.calls.lock().iter().filter(|c| c.as_str() == call).count()
    }

    pub fn deleted(&self) -> Vec<String> {
        self.state.deleted.lock().clone()
    }

    /// Submitted node graphs, in order.
    pub fn prompts(&self) -> Vec<Value> {
        self.state.prompts.lock().iter().map(|(_, p)| p.clone()).collect()
    }
}

pub async fn spawn_fake_comfy() -> FakeComfy {
    let state = Arc::new(FakeState::default());
    let app = Router::new()
        .route("/upload/image", post(upload_image))
        .route("/prompt", post(submit_prompt))
        .route("/queue", get(get_queue).post(delete_from_queue))
        .route("/history/{prompt_id}", get(get_history))
        .route("/view", get(view_image))
        .route("/interrupt", post(interrupt))
        .route("/system_stats", get(system_stats))
        .with_state(state.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind fake image server");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("fake image server");
    });

    FakeComfy {
        base_url: format!("http://{addr}"),
        state,
    }
}

async fn upload_image(State(state): State<Arc<FakeState>>, mut multipart: Multipart) -> Json<Value> {
    let mut name = "upload.png".to_string();
    while let Ok(Some(field)) = multipart.next_field().await {
        if field.name() == Some("image") {
            if let Some(filename) = field.file_name() {
                name = filename.to_string();
            }
        }
        let _ = field.bytes().await;
    }
    state.record("POST /upload/image");
    Json(json!({"name": name, "subfolder": "", "type": "input"}))
}

async fn submit_prompt(State(state): State<Arc<FakeState>>, Json(body): Json<Value>) -> Json<Value> {
    let number = state.counter.fetch_add(1, Ordering::SeqCst) + 1;
    let prompt_id = format!("prompt-{number}");
    state
        .prompts
        .lock()
        .push((prompt_id.clone(), body["prompt"].clone()));
    state.record("POST /prompt");
    Json(json!({"prompt_id": prompt_id, "number": number, "node_errors": {}}))
}

async fn get_queue(State(state): State<Arc<FakeState>>) -> Json<Value> {
    state.record("GET /queue");
    let running: Vec<Value> = if state.hold.load(Ordering::SeqCst) {
        state
            .live_prompts()
            .into_iter()
            .map(|id| json!([0, id, {}, {}, []]))
            .collect()
    } else {
        Vec::new()
    };
    Json(json!({"queue_running": running, "queue_pending": []}))
}

async fn delete_from_queue(State(state): State<Arc<FakeState>>, Json(body): Json<Value>) -> Json<Value> {
    state.record("POST /queue");
    if let Some(ids) = body["delete"].as_array() {
        state
            .deleted
            .lock()
            .extend(ids.iter().filter_map(Value::as_str).map(str::to_string));
    }
    Json(json!({}))
}

async fn get_history(State(state): State<Arc<FakeState>>, Path(prompt_id): Path<String>) -> Json<Value> {
    state.record("GET /history");
    if state.hold.load(Ordering::SeqCst) {
        return Json(json!({}));
    }

    let prompt = state
        .prompts
        .lock()
        .iter()
        .find(|(id, _)| *id == prompt_id)
        .map(|(_, p)| p.clone());
    let Some(prompt) = prompt else {
        return Json(json!({}));
    };

    let prefix = prompt
        .as_object()
        .and_then(|nodes| {
            nodes
                .values()
                .find(|node| node["class_type"] == "SaveImage")
                .and_then(|node| node["inputs"]["filename_prefix"].as_str())
                .map(str::to_string)
        })
        .unwrap_or_else(|| "output".to_string());

    let status = if state.fail_execution.load(Ordering::SeqCst) {
        json!({"status_str": "error", "completed": false})
    } else {
        json!({"status_str": "success", "completed": true})
    };

    let mut history = serde_json::Map::new();
    history.insert(
        prompt_id,
        json!({
            "outputs": {
                "9": {"images": [{"filename": format!("{prefix}_00001_.png"), "subfolder": "", "type": "output"}]}
            },
            "status": status
        }),
    );
    Json(Value::Object(history))
}

async fn view_image(State(state): State<Arc<FakeState>>, Query(_params): Query<HashMap<String, String>>) -> Vec<u8> {
    state.record("GET /view");
    tiny_png()
}

async fn interrupt(State(state): State<Arc<FakeState>>) -> Json<Value> {
    state.record("POST /interrupt");
    Json(json!({}))
}

async fn system_stats(State(state): State<Arc<FakeState>>) -> Json<Value> {
    state.record("GET /system_stats");
    Json(json!({"system": {"os": "fake"}, "devices": []}))
}
