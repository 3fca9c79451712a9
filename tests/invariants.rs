//! Cross-module invariant and end-to-end scenario tests, mirroring the
//! property-based guarantees the pipeline must uphold regardless of which
//! unit tests individual modules carry: single-flight template acquisition,
//! render z-ordering, manifest-to-runtime-spec normalization, and the
//! never-500 contract at the HTTP boundary.

use std::io::{Read, Write};
use std::net::TcpListener;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use forgeimages_core::config::EngineConfig;
use forgeimages_core::http::build_app;
use forgeimages_core::pipeline::{Pipeline, ProcessRequest};
use forgeimages_core::resolver::{ResolveOutcome, TemplateKey, TemplateResolver};
use forgeimages_core::storage::StorageAdapter;
use forgeimages_core::JobResult;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use image::{DynamicImage, ImageBuffer, Rgba};
use tower::ServiceExt;

fn write_zip(path: &Path, entries: &[(&str, &[u8])]) {
    let file = std::fs::File::create(path).unwrap();
    let mut writer = zip::ZipWriter::new(file);
    let options = zip::write::FileOptions::default();
    for (name, data) in entries {
        writer.start_file(*name, options).unwrap();
        writer.write_all(data).unwrap();
    }
    writer.finish().unwrap();
}

fn valid_template_zip_bytes() -> Vec<u8> {
    let dir = tempfile::tempdir().unwrap();
    let zip_path = dir.path().join("tpl.zip");
    let manifest = serde_json::json!({
        "manifestVersion": 1,
        "templateCode": "tpl_concurrent",
        "versionSemver": "0.1.0",
        "output": { "width": 8, "height": 8 },
        "compose": {
            "background": "bg.png",
            "photos": [{ "id": "p1", "source": "raw", "x": 0, "y": 0, "w": 8, "h": 8 }]
        }
    })
    .to_string();

    let bg: image::RgbaImage = ImageBuffer::from_pixel(8, 8, Rgba([1, 2, 3, 255]));
    let mut bg_bytes = std::io::Cursor::new(Vec::new());
    DynamicImage::ImageRgba8(bg)
        .write_to(&mut bg_bytes, image::ImageFormat::Png)
        .unwrap();

    write_zip(
        &zip_path,
        &[
            ("manifest.json", manifest.as_bytes()),
            ("assets/bg.png", bg_bytes.get_ref()),
        ],
    );
    std::fs::read(&zip_path).unwrap()
}

/// A minimal single-file HTTP/1.1 server: every accepted connection is
/// counted, then answered with a fixed 200 response carrying `body`. Good
/// enough to prove single-flight behavior against a real TCP download path
/// without pulling in a mock-server crate for one test.
fn spawn_counting_server(body: Vec<u8>) -> (String, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let hits = Arc::new(AtomicUsize::new(0));
    let hits_for_thread = hits.clone();

    std::thread::spawn(move || {
        for stream in listener.incoming() {
            let Ok(mut stream) = stream else { continue };
            hits_for_thread.fetch_add(1, Ordering::SeqCst);
            let mut buf = [0u8; 1024];
            let _ = stream.read(&mut buf);
            let response = format!(
                "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                body.len()
            );
            let _ = stream.write_all(response.as_bytes());
            let _ = stream.write_all(&body);
        }
    });

    (format!("http://{addr}"), hits)
}

#[tokio::test]
async fn concurrent_resolves_of_a_new_key_download_exactly_once() {
    let body = valid_template_zip_bytes();
    let (base_url, hits) = spawn_counting_server(body);
    let download_url = format!("{base_url}/tpl.zip");

    let cache_dir = tempfile::tempdir().unwrap();
    let resolver = Arc::new(TemplateResolver::new(
        cache_dir.path().to_path_buf(),
        Duration::from_secs(2),
        Duration::from_secs(5),
    ));

    let key = TemplateKey {
        template_code: "tpl_concurrent".into(),
        version_semver: "0.1.0".into(),
        checksum_sha256: forgeimages_core::hashing::sha256_hex(&valid_template_zip_bytes()),
    };

    let mut handles = Vec::new();
    for _ in 0..10 {
        let resolver = resolver.clone();
        let key = key.clone();
        let download_url = download_url.clone();
        handles.push(tokio::spawn(async move {
            resolver.resolve(&key, &download_url).await
        }));
    }

    let mut paths = Vec::new();
    let mut outcomes = Vec::new();
    for h in handles {
        let (path, outcome) = h.await.unwrap().unwrap();
        paths.push(path);
        outcomes.push(outcome);
    }

    assert_eq!(hits.load(Ordering::SeqCst), 1, "exactly one download must hit the network");
    assert!(paths.windows(2).all(|w| w[0] == w[1]), "every caller must observe the same path");
    assert!(paths[0].join("manifest.json").exists());
    assert_eq!(
        outcomes.iter().filter(|o| **o == ResolveOutcome::Downloaded).count(),
        1,
        "exactly one caller performs the extraction"
    );
}

#[tokio::test]
async fn resolve_is_idempotent_with_no_further_network_io_once_cached() {
    let body = valid_template_zip_bytes();
    let (base_url, hits) = spawn_counting_server(body);
    let download_url = format!("{base_url}/tpl.zip");

    let cache_dir = tempfile::tempdir().unwrap();
    let resolver = TemplateResolver::new(
        cache_dir.path().to_path_buf(),
        Duration::from_secs(2),
        Duration::from_secs(5),
    );
    let key = TemplateKey {
        template_code: "tpl_concurrent".into(),
        version_semver: "0.1.0".into(),
        checksum_sha256: forgeimages_core::hashing::sha256_hex(&valid_template_zip_bytes()),
    };

    let (first_path, first_outcome) = resolver.resolve(&key, &download_url).await.unwrap();
    assert_eq!(first_outcome, ResolveOutcome::Downloaded);
    assert_eq!(hits.load(Ordering::SeqCst), 1);

    let (second_path, second_outcome) = resolver.resolve(&key, &download_url).await.unwrap();
    assert_eq!(second_outcome, ResolveOutcome::Cached);
    assert_eq!(second_path, first_path);
    assert_eq!(hits.load(Ordering::SeqCst), 1, "second call must not touch the network");
}

fn test_engine_config(root: &Path) -> EngineConfig {
    EngineConfig {
        cache_root: root.join("cache"),
        storage_root: root.join("output"),
        public_base_url: "http://localhost:9002".to_string(),
        bind_addr: "127.0.0.1:0".parse().unwrap(),
        connect_timeout: Duration::from_millis(500),
        read_timeout: Duration::from_secs(1),
    }
}

/// Posts a `ProcessRequest`-shaped JSON body and returns the parsed response
/// as a raw `Value` - `JobResult` only derives `Serialize` (it is never
/// something this crate needs to parse back in), so the never-500 checks
/// below read the wire shape directly instead.
async fn post_process(app: axum::Router, request: &ProcessRequest) -> serde_json::Value {
    let body = serde_json::to_vec(&serde_json::json!({
        "templateCode": request.template_code,
        "versionSemver": request.version_semver,
        "downloadUrl": request.download_url,
        "checksumSha256": request.checksum_sha256,
        "rawPath": request.raw_path,
    }))
    .unwrap();
    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/pipeline/v2/process")
                .header("content-type", "application/json")
                .body(Body::from(body))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK, "never-500: domain errors are always HTTP 200");
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn never_500_on_unreachable_download_url() {
    let root = tempfile::tempdir().unwrap();
    let app = build_app(&test_engine_config(root.path()));

    let request = ProcessRequest {
        template_code: "tpl_x".into(),
        version_semver: "0.1.0".into(),
        download_url: "http://127.0.0.1:1/unreachable.zip".into(),
        checksum_sha256: "a".repeat(64),
        raw_path: "/tmp/doesnotmatter.png".into(),
    };

    let value = post_process(app, &request).await;
    assert_eq!(value["ok"], false);
    assert_eq!(value["error"]["code"], "TEMPLATE_DOWNLOAD_FAILED");
    assert_eq!(value["error"]["retryable"], true);
    let notes = value["notes"].as_array().unwrap();
    assert!(notes.iter().any(|n| n["code"] == "STAGE_FAILED" && n["detail"]["stage"] == "TEMPLATE_RESOLVE"));
}

#[tokio::test]
async fn never_500_on_checksum_mismatch() {
    let body = valid_template_zip_bytes();
    let (base_url, _hits) = spawn_counting_server(body);
    let download_url = format!("{base_url}/tpl.zip");

    let root = tempfile::tempdir().unwrap();
    let app = build_app(&test_engine_config(root.path()));

    let request = ProcessRequest {
        template_code: "tpl_concurrent".into(),
        version_semver: "0.1.0".into(),
        download_url,
        checksum_sha256: "f".repeat(64),
        raw_path: "/tmp/doesnotmatter.png".into(),
    };

    let value = post_process(app, &request).await;
    assert_eq!(value["ok"], false);
    assert_eq!(value["error"]["code"], "TEMPLATE_CHECKSUM_MISMATCH");
    assert_eq!(value["error"]["retryable"], false);
    assert_eq!(value["error"]["detail"]["expected"], "f".repeat(64));
    assert_eq!(value["error"]["detail"]["actual"].as_str().unwrap().len(), 64);
}

#[tokio::test]
async fn never_500_on_missing_background_asset_with_asset_not_found_note() {
    let root = tempfile::tempdir().unwrap();
    let config = test_engine_config(root.path());

    let checksum = "e".repeat(64);
    let template_dir = config.cache_root.join("tpl_nobg/0.1.0").join(&checksum);
    std::fs::create_dir_all(template_dir.join("assets")).unwrap();
    std::fs::write(
        template_dir.join("manifest.json"),
        serde_json::json!({
            "manifestVersion": 1,
            "templateCode": "tpl_nobg",
            "versionSemver": "0.1.0",
            "output": { "width": 4, "height": 4 },
            "compose": {
                "background": "bg.png",
                "photos": [{ "id": "p1", "source": "raw", "x": 0, "y": 0, "w": 4, "h": 4 }]
            }
        })
        .to_string(),
    )
    .unwrap();

    let app = build_app(&config);
    let request = ProcessRequest {
        template_code: "tpl_nobg".into(),
        version_semver: "0.1.0".into(),
        download_url: "http://127.0.0.1:1/unused.zip".into(),
        checksum_sha256: checksum,
        raw_path: "/tmp/doesnotmatter.png".into(),
    };

    let value = post_process(app, &request).await;
    assert_eq!(value["ok"], false);
    assert_eq!(value["error"]["code"], "ASSET_NOT_FOUND");
    assert_eq!(value["error"]["retryable"], false);
    assert!(value["error"]["detail"]["path"].as_str().unwrap().ends_with("bg.png"));
    let notes = value["notes"].as_array().unwrap();
    assert!(notes.iter().any(|n| n["code"] == "STAGE_FAILED" && n["detail"]["stage"] == "MANIFEST_LOAD"));
    assert!(notes.iter().any(|n| n["code"] == "ASSET_NOT_FOUND" && n["detail"]["path"].as_str().unwrap().ends_with("bg.png")));
}

#[tokio::test]
async fn ten_concurrent_jobs_against_one_cached_template_all_succeed_with_distinct_job_ids() {
    let root = tempfile::tempdir().unwrap();
    let config = test_engine_config(root.path());

    // Pre-seed the cache so every job takes the fast path; distinct job_ids
    // and a single shared URL-shape are what this scenario is testing, not
    // the download race (covered above).
    let checksum = "b".repeat(64);
    let template_dir = config
        .cache_root
        .join("tpl_shared/0.1.0")
        .join(&checksum);
    std::fs::create_dir_all(template_dir.join("assets")).unwrap();
    let bg: image::RgbaImage = ImageBuffer::from_pixel(4, 4, Rgba([9, 9, 9, 255]));
    DynamicImage::ImageRgba8(bg).save(template_dir.join("assets/bg.png")).unwrap();
    std::fs::write(
        template_dir.join("manifest.json"),
        serde_json::json!({
            "manifestVersion": 1,
            "templateCode": "tpl_shared",
            "versionSemver": "0.1.0",
            "output": { "width": 4, "height": 4 },
            "compose": {
                "background": "bg.png",
                "photos": [{ "id": "p1", "source": "raw", "x": 0, "y": 0, "w": 4, "h": 4 }]
            }
        })
        .to_string(),
    )
    .unwrap();

    let raw_dir = tempfile::tempdir().unwrap();
    let raw_path = raw_dir.path().join("raw.png");
    let raw: image::RgbaImage = ImageBuffer::from_pixel(4, 4, Rgba([250, 1, 1, 255]));
    DynamicImage::ImageRgba8(raw).save(&raw_path).unwrap();

    let resolver = TemplateResolver::new(config.cache_root.clone(), config.connect_timeout, config.read_timeout);
    let storage = StorageAdapter::new(config.storage_root.clone(), config.public_base_url.clone());
    let pipeline = Arc::new(Pipeline::new(resolver, storage));

    let mut handles = Vec::new();
    for _ in 0..10 {
        let pipeline = pipeline.clone();
        let raw_path = raw_path.clone();
        let checksum = checksum.clone();
        handles.push(tokio::spawn(async move {
            pipeline
                .process(ProcessRequest {
                    template_code: "tpl_shared".into(),
                    version_semver: "0.1.0".into(),
                    download_url: "http://127.0.0.1:1/unused.zip".into(),
                    checksum_sha256: checksum,
                    raw_path,
                })
                .await
        }));
    }

    let mut job_ids = std::collections::HashSet::new();
    for h in handles {
        match h.await.unwrap() {
            JobResult::Success(s) => {
                assert!(!s.outputs.final_url.is_empty());
                assert!(s.outputs.final_url.contains("/files/final/"));
                assert!(job_ids.insert(s.job_id), "job_ids must be unique per request");
            }
            JobResult::Failure(f) => panic!("expected success, got {:?}", f.error),
        }
    }
    assert_eq!(job_ids.len(), 10);
}

#[test]
fn manifest_normalization_round_trip_preserves_absolute_paths_and_prefix_rule() {
    use forgeimages_core::manifest;
    use serde_json::json;

    let doc = json!({
        "manifestVersion": 1,
        "templateCode": "tpl_rt",
        "versionSemver": "2.3.1",
        "assets": { "basePath": "art" },
        "output": { "width": 200, "height": 100 },
        "compose": {
            "background": "bg.png",
            "photos": [{ "id": "p1", "source": "raw", "x": 0, "y": 0, "w": 50, "h": 50, "z": 2 }],
            "stickers": [
                { "id": "s1", "src": "badge.png", "x": 1, "y": 1, "w": 10, "h": 10 },
                { "id": "s2", "src": "assets/special/badge2.png", "x": 2, "y": 2, "w": 10, "h": 10 }
            ]
        }
    });

    manifest::validate_manifest(&doc).expect("a well-formed manifest must validate");
    let template_dir = Path::new("/var/cache/templates/tpl_rt/2.3.1/deadbeef");
    let spec = manifest::to_runtime_spec(&doc, template_dir).unwrap();

    assert!(spec.background.path.is_absolute());
    assert_eq!(spec.background.path, template_dir.join("art/bg.png"));
    assert_eq!(spec.stickers[0].path, template_dir.join("art/badge.png"));
    assert_eq!(spec.stickers[1].path, template_dir.join("assets/special/badge2.png"));
    assert!(!spec.photos.is_empty());
    assert!(spec.stickers.iter().all(|s| s.path.is_absolute()));
}

#[test]
fn render_layers_combine_photos_and_stickers_with_z_then_declaration_order() {
    use forgeimages_core::manifest::{BackgroundSpec, Fit, OutputSpec, PhotoSpec, RuntimeSpec, StickerSpec};
    use forgeimages_core::render;

    let dir = tempfile::tempdir().unwrap();
    let bg: image::RgbaImage = ImageBuffer::from_pixel(20, 20, Rgba([0, 0, 0, 255]));
    let bg_path = dir.path().join("bg.png");
    DynamicImage::ImageRgba8(bg).save(&bg_path).unwrap();

    // Photo and sticker share z=0. Ties preserve declaration order within
    // the combined photos-then-stickers list, so the sticker is drawn last
    // among the tied layers and wins the overlap.
    let green = dir.path().join("sticker.png");
    let green_img: image::RgbaImage = ImageBuffer::from_pixel(10, 10, Rgba([0, 255, 0, 255]));
    DynamicImage::ImageRgba8(green_img).save(&green).unwrap();

    let spec = RuntimeSpec {
        manifest_version: 1,
        template_code: "tpl_z".into(),
        version_semver: "0.1.0".into(),
        output: OutputSpec { width: 20, height: 20, format: "png".into() },
        background: BackgroundSpec { path: bg_path },
        photos: vec![PhotoSpec {
            id: "p1".into(),
            source: "raw".into(),
            x: 5,
            y: 5,
            w: 10,
            h: 10,
            fit: Fit::Cover,
            z: 0,
        }],
        stickers: vec![StickerSpec {
            id: "s1".into(),
            path: green,
            x: 5,
            y: 5,
            w: 10,
            h: 10,
            rotate: 0.0,
            opacity: 1.0,
            z: 0,
        }],
    };

    let raw = DynamicImage::ImageRgba8(ImageBuffer::from_pixel(10, 10, Rgba([255, 0, 0, 255])));
    let out = render::render(&spec, &raw).unwrap();
    // Photo is declared before the sticker; within the same z, the sticker
    // (declared after, in the combined photos-then-stickers list) is drawn
    // on top and wins the overlap.
    assert_eq!(*out.get_pixel(9, 9), Rgba([0, 255, 0, 255]));
}
