//! HTTP smoke tests against the assembled dev router: middleware order,
//! transform handler headers, HTML rewriting, and error responses.

use baily_core::{resolve_config, DevConfig, DevServer, FlatBundler};
use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

fn write(path: &Path, content: &str) {
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, content).unwrap();
}

async fn spawn_server(files: &[(&str, &str)]) -> (TempDir, SocketAddr) {
    let dir = TempDir::new().unwrap();
    let root = dunce::canonicalize(dir.path()).unwrap();
    for (rel, content) in files {
        write(&root.join(rel), content);
    }

    let config = resolve_config(DevConfig {
        root: Some(root),
        ..Default::default()
    })
    .unwrap();
    let server = DevServer::new(config, Vec::new(), Box::new(FlatBundler)).unwrap();
    let router = server.router();

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });

    (dir, addr)
}

async fn http_get(addr: SocketAddr, path: &str, extra_header: Option<&str>) -> String {
    let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
    let extra = extra_header.map(|h| format!("{h}\r\n")).unwrap_or_default();
    let request =
        format!("GET {path} HTTP/1.1\r\nHost: localhost\r\n{extra}Connection: close\r\n\r\n");
    stream.write_all(request.as_bytes()).await.unwrap();

    let mut buf = Vec::new();
    stream.read_to_end(&mut buf).await.unwrap();
    String::from_utf8_lossy(&buf).into_owned()
}

fn header_value(response: &str, name: &str) -> Option<String> {
    response.lines().find_map(|line| {
        let (key, value) = line.split_once(':')?;
        (key.eq_ignore_ascii_case(name)).then(|| value.trim().to_string())
    })
}

const FILES: &[(&str, &str)] = &[
    (
        "index.html",
        "<html><head><link rel=\"stylesheet\" href=\"/src/styles.css\"></head>\n<body><script type=\"module\" src=\"/src/main.js\"></script></body></html>",
    ),
    ("src/main.js", "import './greet.js';\n"),
    ("src/greet.js", "export const greet = () => {};\n"),
    ("src/styles.css", "body { color: red; }\n"),
    ("public/robots.txt", "User-agent: *\n"),
];

#[tokio::test]
async fn transform_handler_sets_module_headers() {
    let (_dir, addr) = spawn_server(FILES).await;

    let response = http_get(addr, "/src/main.js", None).await;
    assert!(response.starts_with("HTTP/1.1 200"));
    assert_eq!(
        header_value(&response, "content-type").as_deref(),
        Some("application/javascript")
    );
    assert_eq!(
        header_value(&response, "cache-control").as_deref(),
        Some("no-cache")
    );
    let etag = header_value(&response, "etag").expect("etag header");
    assert!(etag.starts_with("W/\""));
    // The served module carries the HMR preamble.
    assert!(response.contains("import.meta.hot ="));

    // A matching If-None-Match answers 304 without a body.
    let revalidated = http_get(
        addr,
        "/src/main.js",
        Some(&format!("If-None-Match: {etag}")),
    )
    .await;
    assert!(revalidated.starts_with("HTTP/1.1 304"));
}

#[tokio::test]
async fn direct_css_is_text_css() {
    let (_dir, addr) = spawn_server(FILES).await;
    let response = http_get(addr, "/src/styles.css", None).await;
    assert!(response.starts_with("HTTP/1.1 200"));
    assert_eq!(
        header_value(&response, "content-type").as_deref(),
        Some("text/css")
    );
    assert!(response.contains("color: red"));
}

#[tokio::test]
async fn html_gets_client_script_injected() {
    let (_dir, addr) = spawn_server(FILES).await;

    for path in ["/", "/index.html"] {
        let response = http_get(addr, path, None).await;
        assert!(response.starts_with("HTTP/1.1 200"), "for {path}");
        assert_eq!(
            header_value(&response, "content-type").as_deref(),
            Some("text/html"),
            "for {path}"
        );
        assert!(response.contains("src=\"/@client\""), "for {path}");
    }
}

#[tokio::test]
async fn client_runtime_served() {
    let (_dir, addr) = spawn_server(FILES).await;
    let response = http_get(addr, "/@client", None).await;
    assert!(response.starts_with("HTTP/1.1 200"));
    assert!(response.contains("createHotContext"));
}

#[tokio::test]
async fn public_assets_served_verbatim() {
    let (_dir, addr) = spawn_server(FILES).await;
    let response = http_get(addr, "/robots.txt", None).await;
    assert!(response.starts_with("HTTP/1.1 200"));
    assert!(response.contains("User-agent: *"));
}

#[tokio::test]
async fn unresolvable_module_is_bad_gateway() {
    let (_dir, addr) = spawn_server(FILES).await;
    let response = http_get(addr, "/src/missing.js", None).await;
    assert!(response.starts_with("HTTP/1.1 502"));
    assert_eq!(
        header_value(&response, "content-type").as_deref(),
        Some("application/json")
    );
    assert!(response.contains("RESOLVE_FAILED"));
}

#[tokio::test]
async fn spa_fallback_serves_index() {
    let (_dir, addr) = spawn_server(FILES).await;
    let response = http_get(addr, "/dashboard", None).await;
    assert!(response.starts_with("HTTP/1.1 200"));
    assert_eq!(
        header_value(&response, "content-type").as_deref(),
        Some("text/html")
    );
}

#[tokio::test]
async fn ping_endpoint_answers() {
    let (_dir, addr) = spawn_server(FILES).await;
    let response = http_get(addr, "/__ping", None).await;
    assert!(response.starts_with("HTTP/1.1 200"));
    assert!(response.contains("pong"));
}
