//! End-to-end tests for the submission workflow.
//!
//! The upload server runs in-process on an ephemeral port. The GitHub API,
//! the build hook / deploy API and an image host are small axum apps that
//! record what they receive.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use summary_press::client::{SubmitRequest, UploadClient};
use summary_press::config::{parse_config, Secrets};
use summary_press::error::UploadError;
use summary_press::pipeline::PipelineContext;
use summary_press::progress::{EventKind, ProgressEvent, Step};
use summary_press::server::router;
use tempfile::TempDir;

const NOTE: &str = "---\nbookTitle: Dune\nbookAuthors: [Frank Herbert]\ntags: [sf, classic]\nsummary: A desert planet, a prophecy and a fight over spice.\n---\n# Dune\n\nBody text.\n";
const PNG: &[u8] = &[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A, 0, 0, 0, 0];

async fn serve(app: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}", addr)
}

// ─── Mock GitHub ────────────────────────────────────────────────────

#[derive(Default)]
struct GitHubState {
    refs: HashMap<String, String>,
    counter: u32,
    commits: Vec<String>,
    tree_paths: Vec<String>,
    pulls_created: u32,
    open_pr: Option<(String, String)>,
}

type Shared = Arc<Mutex<GitHubState>>;

impl GitHubState {
    fn next(&mut self, prefix: &str) -> String {
        self.counter += 1;
        format!("{}-{}", prefix, self.counter)
    }
}

async fn gh_get_ref(State(s): State<Shared>, Path((_, _, branch)): Path<(String, String, String)>) -> impl IntoResponse {
    let s = s.lock().unwrap();
    match s.refs.get(&branch) {
        Some(sha) => (StatusCode::OK, Json(json!({ "object": { "sha": sha } }))),
        None => (StatusCode::NOT_FOUND, Json(json!({ "message": "Not Found" }))),
    }
}

async fn gh_create_ref(State(s): State<Shared>, Json(body): Json<Value>) -> impl IntoResponse {
    let name = body["ref"].as_str().unwrap().trim_start_matches("refs/heads/").to_string();
    let sha = body["sha"].as_str().unwrap().to_string();
    s.lock().unwrap().refs.insert(name, sha.clone());
    (StatusCode::CREATED, Json(json!({ "object": { "sha": sha } })))
}

async fn gh_update_ref(
    State(s): State<Shared>,
    Path((_, _, branch)): Path<(String, String, String)>,
    Json(body): Json<Value>,
) -> impl IntoResponse {
    let sha = body["sha"].as_str().unwrap().to_string();
    s.lock().unwrap().refs.insert(branch, sha.clone());
    Json(json!({ "object": { "sha": sha } }))
}

async fn gh_blob(State(s): State<Shared>, Json(body): Json<Value>) -> impl IntoResponse {
    assert_eq!(body["encoding"], "base64");
    let sha = s.lock().unwrap().next("blob");
    (StatusCode::CREATED, Json(json!({ "sha": sha })))
}

async fn gh_get_commit(Path((_, _, sha)): Path<(String, String, String)>) -> impl IntoResponse {
    Json(json!({ "sha": sha, "tree": { "sha": format!("tree-of-{}", sha) } }))
}

async fn gh_tree(State(s): State<Shared>, Json(body): Json<Value>) -> impl IntoResponse {
    let mut s = s.lock().unwrap();
    for entry in body["tree"].as_array().unwrap() {
        s.tree_paths.push(entry["path"].as_str().unwrap().to_string());
    }
    let sha = s.next("tree");
    (StatusCode::CREATED, Json(json!({ "sha": sha })))
}

async fn gh_commit(State(s): State<Shared>, Json(body): Json<Value>) -> impl IntoResponse {
    let mut s = s.lock().unwrap();
    s.commits.push(body["message"].as_str().unwrap().to_string());
    let sha = s.next("commit");
    (StatusCode::CREATED, Json(json!({ "sha": sha })))
}

async fn gh_create_pull(State(s): State<Shared>, Json(body): Json<Value>) -> impl IntoResponse {
    let mut s = s.lock().unwrap();
    let head = body["head"].as_str().unwrap().to_string();
    if s.open_pr.as_ref().map(|(h, _)| h == &head).unwrap_or(false) {
        return (
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(json!({ "message": "Validation Failed", "errors": [{ "message": "A pull request already exists" }] })),
        );
    }
    s.pulls_created += 1;
    let url = format!("https://github.example/acme/summaries/pull/{}", s.pulls_created);
    s.open_pr = Some((head, url.clone()));
    (StatusCode::CREATED, Json(json!({ "html_url": url })))
}

async fn gh_list_pulls(State(s): State<Shared>, Query(q): Query<HashMap<String, String>>) -> impl IntoResponse {
    let s = s.lock().unwrap();
    let head = q.get("head").cloned().unwrap_or_default();
    let prs: Vec<Value> = s
        .open_pr
        .iter()
        .filter(|(h, _)| head == format!("acme:{}", h))
        .map(|(_, url)| json!({ "html_url": url }))
        .collect();
    Json(Value::Array(prs))
}

async fn gh_repo() -> impl IntoResponse {
    Json(json!({ "full_name": "acme/summaries" }))
}

fn github_app(state: Shared) -> Router {
    Router::new()
        .route("/repos/{owner}/{repo}", get(gh_repo))
        .route("/repos/{owner}/{repo}/git/ref/heads/{*branch}", get(gh_get_ref))
        .route("/repos/{owner}/{repo}/git/refs", post(gh_create_ref))
        .route(
            "/repos/{owner}/{repo}/git/refs/heads/{*branch}",
            axum::routing::patch(gh_update_ref),
        )
        .route("/repos/{owner}/{repo}/git/blobs", post(gh_blob))
        .route("/repos/{owner}/{repo}/git/commits/{sha}", get(gh_get_commit))
        .route("/repos/{owner}/{repo}/git/commits", post(gh_commit))
        .route("/repos/{owner}/{repo}/git/trees", post(gh_tree))
        .route("/repos/{owner}/{repo}/pulls", post(gh_create_pull).get(gh_list_pulls))
        .with_state(state)
}

// ─── Mock build hook, deploy API and site ───────────────────────────

#[derive(Clone, Default)]
struct NetlifyState {
    hooks: Arc<Mutex<Vec<String>>>,
    base: Arc<Mutex<String>>,
    /// When set, the hook no longer starts deploys and the listing keeps
    /// showing the deploy that predates it.
    frozen: Arc<AtomicBool>,
}

async fn nf_hook(State(s): State<NetlifyState>, Query(q): Query<HashMap<String, String>>) -> impl IntoResponse {
    s.hooks
        .lock()
        .unwrap()
        .push(q.get("trigger_title").cloned().unwrap_or_default());
    StatusCode::OK
}

/// `d0` is the deploy that was live before any trigger; `dN` is started by
/// the N-th hook call.
fn deploy_json(s: &NetlifyState, id: &str) -> Value {
    let created = if id == "d0" {
        chrono::Utc::now() - chrono::Duration::seconds(10)
    } else {
        chrono::Utc::now()
    };
    json!({
        "id": id,
        "state": "ready",
        "created_at": created.to_rfc3339(),
        "ssl_url": s.base.lock().unwrap().clone(),
    })
}

async fn nf_deploys(State(s): State<NetlifyState>) -> impl IntoResponse {
    let hooks = s.hooks.lock().unwrap().len();
    let id = if hooks == 0 || s.frozen.load(Ordering::SeqCst) {
        "d0".to_string()
    } else {
        format!("d{}", hooks)
    };
    Json(json!([deploy_json(&s, &id)]))
}

async fn nf_deploy(State(s): State<NetlifyState>, Path(id): Path<String>) -> impl IntoResponse {
    Json(deploy_json(&s, &id))
}

async fn nf_page(Path(slug): Path<String>) -> impl IntoResponse {
    format!("<h1>{}</h1>", slug)
}

async fn netlify() -> (String, NetlifyState) {
    let state = NetlifyState::default();
    let app = Router::new()
        .route("/build_hooks/{id}", post(nf_hook))
        .route("/api/v1/sites/{id}", get(|| async { Json(json!({ "name": "summaries" })) }))
        .route("/api/v1/sites/{id}/deploys", get(nf_deploys))
        .route("/api/v1/deploys/{id}", get(nf_deploy))
        .route("/summaries/{slug}", get(nf_page))
        .with_state(state.clone());
    let base = serve(app).await;
    *state.base.lock().unwrap() = base.clone();
    (base, state)
}

async fn image_host() -> String {
    let app = Router::new()
        .route("/ok.png", get(|| async { ([("content-type", "image/png")], PNG.to_vec()) }))
        .route("/missing.png", get(|| async { StatusCode::NOT_FOUND }));
    serve(app).await
}

// ─── Fixture ────────────────────────────────────────────────────────

struct Harness {
    _tmp: TempDir,
    server: String,
    github: Shared,
    netlify: NetlifyState,
}

async fn harness() -> Harness {
    harness_with_deploy_timeout(10).await
}

async fn harness_with_deploy_timeout(timeout_secs: u64) -> Harness {
    let tmp = TempDir::new().unwrap();
    let github = Shared::default();
    github
        .lock()
        .unwrap()
        .refs
        .insert("develop".to_string(), "base-sha".to_string());
    let gh_base = serve(github_app(github.clone())).await;
    let (nf_base, netlify) = netlify().await;

    let toml = format!(
        r#"
[upload]
temp_dir = "{tmp}"

[validation]
image_timeout_secs = 2

[storage]
targets = ["github"]

[storage.github]
owner = "acme"
repo = "summaries"
api_base = "{gh}"
max_retries = 0

[deploy]
api_base = "{nf}/api/v1"
track = true
poll_interval_secs = 1
timeout_secs = {timeout}
max_retries = 0
"#,
        tmp = tmp.path().join("uploads").display(),
        gh = gh_base,
        nf = nf_base,
        timeout = timeout_secs,
    );
    let config = parse_config(&toml).unwrap();
    let secrets = Secrets {
        github_token: Some("gh-token".into()),
        build_hook: Some(format!("{}/build_hooks/abc", nf_base)),
        netlify_site_id: Some("site-1".into()),
        netlify_api_token: Some("nf-token".into()),
        api_keys: vec!["k1".into()],
        ..Secrets::default()
    };
    let ctx = PipelineContext::new(config, secrets).unwrap();
    let server = serve(router(ctx)).await;

    Harness {
        _tmp: tmp,
        server,
        github,
        netlify,
    }
}

fn write_files(dir: &TempDir, note: &str) -> SubmitRequest {
    let note_path = dir.path().join("dune.md");
    let cover_path = dir.path().join("dune.png");
    std::fs::write(&note_path, note).unwrap();
    std::fs::write(&cover_path, PNG).unwrap();
    SubmitRequest {
        note_path,
        cover_path,
        contributor: Some("Ada".into()),
        draft: false,
        note_id: None,
    }
}

fn errors(events: &[ProgressEvent]) -> Vec<&ProgressEvent> {
    events.iter().filter(|e| e.kind == EventKind::Error).collect()
}

// ─── Tests ──────────────────────────────────────────────────────────

#[tokio::test]
async fn disallowed_extension_is_rejected_before_any_request() {
    let files = TempDir::new().unwrap();
    let mut req = write_files(&files, NOTE);
    let txt = files.path().join("dune.txt");
    std::fs::write(&txt, NOTE).unwrap();
    req.note_path = txt;

    // Nothing listens on this port; a request would be a transport error.
    let client = UploadClient::new("http://127.0.0.1:1").unwrap();
    let err = client.submit(&req, |_| {}).await.unwrap_err();
    match err {
        UploadError::Validation(fields) => assert_eq!(fields[0].field, "fileName"),
        other => panic!("expected a validation error, got {:?}", other),
    }
}

#[tokio::test]
async fn missing_field_yields_field_tagged_error() {
    let h = harness().await;
    let files = TempDir::new().unwrap();
    let note = NOTE.replace("tags: [sf, classic]\n", "");
    let req = write_files(&files, &note);

    let client = UploadClient::new(&h.server).unwrap();
    let outcome = client.submit(&req, |_| {}).await.unwrap();

    assert!(!outcome.success);
    let errs = errors(&outcome.events);
    assert!(errs.iter().all(|e| e.step == Step::Validation));
    assert!(errs.iter().any(|e| e.message.starts_with("tags:")), "{:?}", errs);
    assert!(h.github.lock().unwrap().commits.is_empty());
}

#[tokio::test]
async fn unreachable_image_is_rejected() {
    let h = harness().await;
    let images = image_host().await;
    let files = TempDir::new().unwrap();
    let note = format!(
        "{}\n![Map of Arrakis]({}/ok.png)\n\n![Sandworm]({}/missing.png)\n",
        NOTE, images, images
    );
    let req = write_files(&files, &note);

    let client = UploadClient::new(&h.server).unwrap();
    let outcome = client.submit(&req, |_| {}).await.unwrap();

    assert!(!outcome.success);
    let errs = errors(&outcome.events);
    assert!(errs.iter().any(|e| e.message.contains("missing.png") && e.message.contains("not reachable")));
    assert!(!errs.iter().any(|e| e.message.contains("ok.png")));
}

#[tokio::test]
async fn successful_submission_completes_with_reachable_url() {
    let h = harness().await;
    let files = TempDir::new().unwrap();
    let req = write_files(&files, NOTE);

    let client = UploadClient::new(&h.server).unwrap();
    let mut seen = Vec::new();
    let outcome = client
        .submit(&req, |e| seen.push(e.step))
        .await
        .unwrap();

    assert!(outcome.success, "{:?}", outcome.events);
    let last = outcome.events.last().unwrap();
    assert_eq!(last.step, Step::Complete);
    assert_eq!(last.kind, EventKind::Success);
    assert_eq!(seen.first(), Some(&Step::Validation));
    assert!(seen.contains(&Step::Upload) && seen.contains(&Step::Build));

    let url = outcome.url.unwrap();
    assert!(url.ends_with("/summaries/dune"), "{}", url);
    let page = reqwest::get(&url).await.unwrap();
    assert!(page.status().is_success());

    let gh = h.github.lock().unwrap();
    assert_eq!(gh.tree_paths, vec!["public/img/dune.png", "src/summaries/dune.md"]);
    assert_eq!(gh.commits, vec!["[summary] Dune"]);
    assert_eq!(h.netlify.hooks.lock().unwrap().as_slice(), ["New summary: Dune"]);
}

#[tokio::test]
async fn resubmission_reuses_open_pull_request() {
    let h = harness().await;
    let files = TempDir::new().unwrap();
    let req = write_files(&files, NOTE);
    let client = UploadClient::new(&h.server).unwrap();

    let first = client.submit(&req, |_| {}).await.unwrap();
    assert!(first.success);
    let second = client.submit(&req, |_| {}).await.unwrap();
    assert!(second.success, "{:?}", second.events);

    let pr_url = |events: &[ProgressEvent]| {
        events
            .iter()
            .find(|e| e.step == Step::Upload && e.kind == EventKind::Success)
            .and_then(|e| e.url.clone())
            .unwrap()
    };
    assert_eq!(pr_url(&first.events), pr_url(&second.events));
    assert!(second
        .events
        .iter()
        .any(|e| e.message.starts_with("A pull request already exists")));

    let gh = h.github.lock().unwrap();
    assert_eq!(gh.pulls_created, 1);
    assert_eq!(gh.commits.len(), 2);
    assert!(gh.refs["notes/upload-develop"].starts_with("commit-"));
}

#[tokio::test]
async fn silent_upload_then_submit_by_id() {
    let h = harness().await;
    let files = TempDir::new().unwrap();
    let mut req = write_files(&files, NOTE);
    let client = UploadClient::new(&h.server).unwrap();

    let silent = client.silent_upload(&req.note_path).await.unwrap();
    assert!(silent.success, "{:?}", silent.errors);
    assert_eq!(silent.frontmatter["bookTitle"], "Dune");
    let id = silent.id.unwrap();

    let stored: Value = reqwest::get(format!("{}/api/upload-temp?id={}", h.server, id))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(stored["fileName"], "dune.md");

    req.note_id = Some(id.clone());
    let outcome = client.submit(&req, |_| {}).await.unwrap();
    assert!(outcome.success, "{:?}", outcome.events);

    let gone = reqwest::get(format!("{}/api/upload-temp?id={}", h.server, id))
        .await
        .unwrap();
    assert_eq!(gone.status(), 404);
}

#[tokio::test]
async fn silent_upload_reports_grouped_problems() {
    let h = harness().await;
    let files = TempDir::new().unwrap();
    let note = NOTE.replace("summary: A desert planet, a prophecy and a fight over spice.\n", "");
    let req = write_files(&files, &format!("{}\n![](http://127.0.0.1:1/a.png)\n", note));
    let client = UploadClient::new(&h.server).unwrap();

    let silent = client.silent_upload(&req.note_path).await.unwrap();
    assert!(!silent.success);
    assert!(silent.id.is_some());
    assert_eq!(silent.frontmatter_errors[0].field, "summary");
    assert_eq!(silent.errors[0], "Frontmatter problems:");
    assert!(silent.errors.contains(&"Image problems:".to_string()));
}

#[tokio::test]
async fn admin_endpoints_require_api_key() {
    let h = harness().await;
    let http = reqwest::Client::new();

    let resp = http
        .get(format!("{}/api/storage/health", h.server))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 401);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["code"], "unauthorized");

    let resp = http
        .get(format!("{}/api/storage/health", h.server))
        .bearer_auth("k1")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["ok"], true);
    assert_eq!(body["targets"][0]["target"], "github");
}

#[tokio::test]
async fn manual_build_trigger_streams_to_completion() {
    let h = harness().await;
    let client = UploadClient::new(&h.server)
        .unwrap()
        .with_api_key(Some("k1".into()));

    let outcome = client.trigger_build(Some("Rebuild"), |_| {}).await.unwrap();
    assert!(outcome.success, "{:?}", outcome.events);
    assert_eq!(h.netlify.hooks.lock().unwrap().as_slice(), ["Rebuild"]);

    let report = client.build_check().await.unwrap();
    assert!(report.ok, "{:?}", report.checks);
    let site = report.checks.iter().find(|c| c.name == "site").unwrap();
    assert_eq!(site.message, "site summaries found");
}

#[tokio::test]
async fn missing_token_is_a_configuration_error() {
    let tmp = TempDir::new().unwrap();
    let toml = format!(
        "[upload]\ntemp_dir = \"{}\"\n[storage]\ntargets = [\"github\"]\n[storage.github]\nowner = \"acme\"\nrepo = \"summaries\"\n",
        tmp.path().join("uploads").display()
    );
    let ctx = PipelineContext::new(parse_config(&toml).unwrap(), Secrets::default()).unwrap();
    let server = serve(router(ctx)).await;

    let files = TempDir::new().unwrap();
    let req = write_files(&files, NOTE);
    let err = UploadClient::new(&server)
        .unwrap()
        .submit(&req, |_| {})
        .await
        .unwrap_err();
    match err {
        UploadError::Configuration(msg) => assert!(msg.contains("GITHUB_TOKEN"), "{}", msg),
        other => panic!("expected a configuration error, got {:?}", other),
    }
}

#[tokio::test]
async fn build_does_not_complete_on_the_deploy_that_predates_it() {
    let h = harness_with_deploy_timeout(2).await;
    h.netlify.frozen.store(true, Ordering::SeqCst);
    let client = UploadClient::new(&h.server)
        .unwrap()
        .with_api_key(Some("k1".into()));

    let outcome = client.trigger_build(Some("Rebuild"), |_| {}).await.unwrap();

    assert!(!outcome.success, "{:?}", outcome.events);
    assert!(!outcome.events.iter().any(|e| e.step == Step::Complete));
    let errs = errors(&outcome.events);
    assert!(errs.iter().any(|e| e.message.contains("did not finish")), "{:?}", errs);
    assert_eq!(h.netlify.hooks.lock().unwrap().len(), 1);
}
