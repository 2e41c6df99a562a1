//! Mock path-generation engine for integration testing
//!
//! Accepts the engine's command line, serves its REST contract on
//! `127.0.0.1:PORT/graphwalker` and walks the first model's vertices and
//! edges, interleaved, in file order.
//!
//! Environment knobs:
//! - `MOCK_ENGINE_SILENT=1`: bind but never print the readiness marker
//! - `MOCK_ENGINE_MALFORMED_AT=N`: step N (1-based) comes back without a name

use std::collections::VecDeque;
use std::io::Write;
use std::sync::Arc;

use axum::extract::State;
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde_json::{json, Map, Value};
use tokio::sync::Mutex;

const READY_MARKER: &str = "[HttpServer] Started";

#[derive(Debug, Default)]
struct Args {
    port: u16,
    models: Vec<(String, String)>,
    blocked: bool,
    start_element: Option<String>,
}

fn parse_args() -> Result<Args, String> {
    let mut args = Args {
        port: 8887,
        ..Args::default()
    };
    let mut iter = std::env::args().skip(1);

    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "-p" | "--port" => {
                let value = iter.next().ok_or("missing value for -p")?;
                args.port = value.parse().map_err(|e| format!("invalid port: {}", e))?;
            }
            "-m" | "--model" => {
                let path = iter.next().ok_or("missing model path")?;
                let generator = iter.next().ok_or("missing generator")?;
                args.models.push((path, generator));
            }
            "-e" | "--start-element" => {
                args.start_element = Some(iter.next().ok_or("missing start element")?);
            }
            "-d" | "--debug" | "-s" | "--service" => {
                iter.next();
            }
            "--blocked" => args.blocked = true,
            // "online", "-jar <file>" and anything else the real engine takes
            _ => {}
        }
    }

    Ok(args)
}

/// Build the path: vertex 0, edge 0, vertex 1, edge 1, ...
fn build_path(model_file: &Value) -> (String, Vec<Value>) {
    let model = model_file
        .get("models")
        .and_then(|models| models.get(0))
        .unwrap_or(model_file);
    let name = model
        .get("name")
        .and_then(Value::as_str)
        .unwrap_or("Model")
        .to_string();

    let empty = Vec::new();
    let vertices = model.get("vertices").and_then(Value::as_array).unwrap_or(&empty);
    let edges = model.get("edges").and_then(Value::as_array).unwrap_or(&empty);

    let mut path = Vec::new();
    for i in 0..vertices.len().max(edges.len()) {
        path.extend(vertices.get(i).cloned());
        path.extend(edges.get(i).cloned());
    }
    (name, path)
}

struct Engine {
    model_name: String,
    full_path: Vec<Value>,
    remaining: VecDeque<Value>,
    data: Map<String, Value>,
    taken: usize,
    malformed_at: Option<usize>,
}

impl Engine {
    fn new(model_name: String, path: Vec<Value>, malformed_at: Option<usize>) -> Self {
        Self {
            model_name,
            remaining: path.clone().into(),
            full_path: path,
            data: Map::new(),
            taken: 0,
            malformed_at,
        }
    }
}

type Shared = Arc<Mutex<Engine>>;

async fn has_next(State(engine): State<Shared>) -> Json<Value> {
    let engine = engine.lock().await;
    let flag = if engine.remaining.is_empty() { "false" } else { "true" };
    Json(json!({ "result": "ok", "hasNext": flag }))
}

async fn get_next(State(engine): State<Shared>) -> Json<Value> {
    let mut engine = engine.lock().await;
    let Some(element) = engine.remaining.pop_front() else {
        return Json(json!({ "result": "nok", "error": "no more steps" }));
    };
    engine.taken += 1;

    let id = element.get("id").cloned().unwrap_or(Value::Null);
    if engine.malformed_at == Some(engine.taken) {
        return Json(json!({ "result": "ok", "currentElementID": id }));
    }

    let mut step = json!({
        "result": "ok",
        "currentElementID": id,
        "currentElementName": element.get("name").cloned().unwrap_or(Value::Null),
        "modelName": engine.model_name,
        "data": Value::Object(engine.data.clone()),
    });
    for field in ["properties", "actions"] {
        if let Some(value) = element.get(field) {
            step[field] = value.clone();
        }
    }
    Json(step)
}

async fn get_data(State(engine): State<Shared>) -> Json<Value> {
    let engine = engine.lock().await;
    Json(json!({ "result": "ok", "data": Value::Object(engine.data.clone()) }))
}

async fn set_data(State(engine): State<Shared>, Json(body): Json<Value>) -> Json<Value> {
    let mut engine = engine.lock().await;
    match body {
        Value::Object(data) => {
            engine.data = data;
            Json(json!({ "result": "ok" }))
        }
        _ => Json(json!({ "result": "nok", "error": "data must be an object" })),
    }
}

async fn restart(State(engine): State<Shared>) -> Json<Value> {
    let mut engine = engine.lock().await;
    engine.remaining = engine.full_path.clone().into();
    engine.data.clear();
    engine.taken = 0;
    Json(json!({ "result": "ok" }))
}

async fn get_statistics(State(engine): State<Shared>) -> Json<Value> {
    let engine = engine.lock().await;
    Json(json!({
        "result": "ok",
        "totalNumberOfElements": engine.full_path.len(),
        "totalNumberOfVisitedElements": engine.taken,
        "steps": engine.taken,
    }))
}

async fn load(State(engine): State<Shared>, Json(body): Json<Value>) -> Json<Value> {
    let mut engine = engine.lock().await;
    let (name, path) = build_path(&body);
    let malformed_at = engine.malformed_at;
    *engine = Engine::new(name, path, malformed_at);
    Json(json!({ "result": "ok" }))
}

#[tokio::main]
async fn main() {
    let args = match parse_args() {
        Ok(args) => args,
        Err(e) => {
            eprintln!("mock_engine: {}", e);
            std::process::exit(2);
        }
    };

    let (model_name, mut path) = match args.models.first() {
        Some((file, _generator)) => {
            let content = match std::fs::read_to_string(file) {
                Ok(content) => content,
                Err(e) => {
                    eprintln!("mock_engine: cannot read model {}: {}", file, e);
                    std::process::exit(1);
                }
            };
            match serde_json::from_str::<Value>(&content) {
                Ok(model) => build_path(&model),
                Err(e) => {
                    eprintln!("mock_engine: invalid model {}: {}", file, e);
                    std::process::exit(1);
                }
            }
        }
        None => ("Model".to_string(), Vec::new()),
    };

    if args.blocked {
        path.retain(|element| {
            element.pointer("/properties/blocked").and_then(Value::as_bool) != Some(true)
        });
    }
    if let Some(start) = &args.start_element {
        if let Some(index) = path.iter().position(|element| {
            element.get("id").and_then(Value::as_str) == Some(start.as_str())
                || element.get("name").and_then(Value::as_str) == Some(start.as_str())
        }) {
            path.drain(..index);
        }
    }

    let malformed_at = std::env::var("MOCK_ENGINE_MALFORMED_AT")
        .ok()
        .and_then(|value| value.parse().ok());
    let engine: Shared = Arc::new(Mutex::new(Engine::new(model_name, path, malformed_at)));

    let listener = match tokio::net::TcpListener::bind(("127.0.0.1", args.port)).await {
        Ok(listener) => listener,
        Err(e) => {
            eprintln!("Failed to bind port {}: {}", args.port, e);
            std::process::exit(1);
        }
    };

    let api = Router::new()
        .route("/hasNext", get(has_next))
        .route("/getNext", get(get_next))
        .route("/getData", get(get_data))
        .route("/setData", put(set_data))
        .route("/restart", put(restart))
        .route("/getStatistics", get(get_statistics))
        .route("/load", post(load))
        .with_state(engine);
    let app = Router::new().nest("/graphwalker", api);

    if std::env::var("MOCK_ENGINE_SILENT").as_deref() != Ok("1") {
        println!("{}", READY_MARKER);
        let _ = std::io::stdout().flush();
    }

    if let Err(e) = axum::serve(listener, app).await {
        eprintln!("mock_engine: server error: {}", e);
        std::process::exit(1);
    }
}
