//! End-to-end pipeline tests against a mock archive server.
//!
//! These exercise the public API only: resolve a manifest, run a job, and
//! observe the broadcast events and returned pages.

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#![allow(clippy::unwrap_used, clippy::expect_used)]

use async_trait::async_trait;
use image::codecs::png::PngEncoder;
use image::{Rgb, RgbImage};
use manuscript_dl::{
    Config, Event, JobControl, Manifest, ManifestResolver, ManuscriptDownloader, PageDescriptor,
    Result, TileKind, TiledPyramid,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

struct DirectResolver {
    calls: AtomicUsize,
    pages: u32,
}

impl DirectResolver {
    fn new(pages: u32) -> Self {
        Self {
            calls: AtomicUsize::new(0),
            pages,
        }
    }
}

#[async_trait]
impl ManifestResolver for DirectResolver {
    async fn resolve(&self, url: &str) -> Result<Manifest> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let pages = (1..=self.pages)
            .map(|n| PageDescriptor::DirectImage {
                url: format!("{url}/p{n}.jpg"),
                referer: None,
                headers: vec![],
            })
            .collect();
        Manifest::new(url, "BSB Clm 1234", pages)
    }
}

async fn downloader(dir: &tempfile::TempDir, bytes_per_page: u64, threshold: u64) -> ManuscriptDownloader {
    let mut config = Config::default();
    config.persistence.database_path = dir.path().join("cache.db");
    config.download.default_bytes_per_page = bytes_per_page;
    config.download.size_threshold_bytes = threshold;
    config.retry.initial_delay = Duration::from_millis(5);
    config.retry.max_delay = Duration::from_millis(20);
    config.retry.jitter = false;
    ManuscriptDownloader::new(config).await.unwrap()
}

async fn mount_pages(server: &MockServer, pages: u32) {
    for page in 1..=pages {
        Mock::given(method("GET"))
            .and(path(format!("/p{page}.jpg")))
            .respond_with(
                ResponseTemplate::new(200).set_body_bytes(format!("image-{page}").into_bytes()),
            )
            .mount(server)
            .await;
    }
}

#[tokio::test]
async fn resolve_and_download_multi_part_job() {
    let server = MockServer::start().await;
    mount_pages(&server, 9).await;

    let dir = tempfile::tempdir().unwrap();
    // 1 byte per page, threshold 4: 9 pages split into 3 parts of 3
    let dl = downloader(&dir, 1, 4).await;
    let resolver = DirectResolver::new(9);

    let manifest = dl.resolve_manifest(&resolver, &server.uri()).await.unwrap();
    let result = dl.run_job(manifest, &JobControl::new()).await.unwrap();

    assert_eq!(result.succeeded_pages, 9);
    assert_eq!(result.fatal_failures, 0);
    assert_eq!(result.parts.len(), 3);
    assert_eq!(
        result
            .parts
            .iter()
            .flat_map(|p| p.pages.iter().map(|pg| pg.page_number))
            .collect::<Vec<_>>(),
        (1..=9).collect::<Vec<_>>()
    );
    assert_eq!(result.parts[1].pages[0].bytes, b"image-4");

    // Parts run strictly one after another: the request log must group into
    // chunks that never mix pages from two parts
    let requests = server.received_requests().await.unwrap();
    assert_eq!(requests.len(), 9);
    let part_of = |p: &str| -> usize {
        let n: u32 = p
            .trim_start_matches("/p")
            .trim_end_matches(".jpg")
            .parse()
            .unwrap();
        ((n - 1) / 3) as usize
    };
    let observed: Vec<usize> = requests
        .iter()
        .map(|r| part_of(r.url.path()))
        .collect();
    let mut sorted = observed.clone();
    sorted.sort_unstable();
    assert_eq!(
        observed, sorted,
        "a request from a later part arrived before an earlier part finished"
    );
}

#[tokio::test]
async fn second_resolve_is_served_from_cache() {
    let server = MockServer::start().await;
    mount_pages(&server, 2).await;

    let dir = tempfile::tempdir().unwrap();
    let dl = downloader(&dir, 1, 100).await;
    let resolver = DirectResolver::new(2);

    let first = dl.resolve_manifest(&resolver, &server.uri()).await.unwrap();
    let second = dl.resolve_manifest(&resolver, &server.uri()).await.unwrap();

    assert_eq!(resolver.calls.load(Ordering::SeqCst), 1);
    assert_eq!(first.pages, second.pages);

    // Invalidation brings the resolver back into the loop
    assert!(dl.invalidate_manifest(&server.uri()).await.unwrap());
    dl.resolve_manifest(&resolver, &server.uri()).await.unwrap();
    assert_eq!(resolver.calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn tiled_page_is_stitched_into_a_full_jpeg() {
    let server = MockServer::start().await;

    // 6x6 page, 4px tiles, no overlap: 2x2 grid at the derived top level 3
    let tile_px = |w: u32, h: u32, rgb: [u8; 3]| -> Vec<u8> {
        let img = RgbImage::from_pixel(w, h, Rgb(rgb));
        let mut out = Vec::new();
        img.write_with_encoder(PngEncoder::new(&mut out)).unwrap();
        out
    };
    for (col, row, w, h) in [(0u32, 0u32, 4u32, 4u32), (1, 0, 2, 4), (0, 1, 4, 2), (1, 1, 2, 2)] {
        Mock::given(method("GET"))
            .and(path(format!("/tiles/3/{col}_{row}.png")))
            .respond_with(
                ResponseTemplate::new(200).set_body_bytes(tile_px(w, h, [200, 30, 30])),
            )
            .mount(&server)
            .await;
    }

    let manifest = Manifest::new(
        server.uri(),
        "Tiled MS",
        vec![PageDescriptor::Tiled(TiledPyramid {
            kind: TileKind::Generic,
            base_url: format!("{}/tiles", server.uri()),
            tile_size: 4,
            overlap: 0,
            levels: 0,
            full_width: 6,
            full_height: 6,
            format: "png".to_string(),
        })],
    )
    .unwrap();

    let dir = tempfile::tempdir().unwrap();
    let dl = downloader(&dir, 1, 100).await;
    let result = dl.run_job(manifest, &JobControl::new()).await.unwrap();

    assert_eq!(result.succeeded_pages, 1);
    let page = &result.parts[0].pages[0];
    let decoded = image::load_from_memory(&page.bytes).unwrap();
    assert_eq!(
        (decoded.width(), decoded.height()),
        (6, 6),
        "canvas must match the pyramid's full dimensions exactly"
    );
}

#[tokio::test]
async fn direct_page_headers_reach_the_server() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/guarded.jpg"))
        .and(header("Referer", "https://viewer.example/ms"))
        .and(header("X-Requested-With", "downloader"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"ok".to_vec()))
        .expect(1)
        .mount(&server)
        .await;

    let manifest = Manifest::new(
        server.uri(),
        "Guarded MS",
        vec![PageDescriptor::DirectImage {
            url: format!("{}/guarded.jpg", server.uri()),
            referer: Some("https://viewer.example/ms".to_string()),
            headers: vec![("X-Requested-With".to_string(), "downloader".to_string())],
        }],
    )
    .unwrap();

    let dir = tempfile::tempdir().unwrap();
    let dl = downloader(&dir, 1, 100).await;
    let result = dl.run_job(manifest, &JobControl::new()).await.unwrap();
    assert_eq!(result.succeeded_pages, 1);
}

#[tokio::test]
async fn cancellation_mid_job_keeps_finished_parts() {
    let server = MockServer::start().await;
    mount_pages(&server, 2).await;
    // Part 2's pages respond slowly so the cancel lands while they are in
    // flight
    for page in 3..=4 {
        Mock::given(method("GET"))
            .and(path(format!("/p{page}.jpg")))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_bytes(b"slow".to_vec())
                    .set_delay(Duration::from_millis(400)),
            )
            .mount(&server)
            .await;
    }

    let dir = tempfile::tempdir().unwrap();
    // 2 parts of 2 pages
    let dl = downloader(&dir, 1, 2).await;
    let control = JobControl::new();

    // Cancel as soon as the first part completes
    let mut events = dl.subscribe();
    {
        let control = control.clone();
        tokio::spawn(async move {
            while let Ok(event) = events.recv().await {
                if matches!(event, Event::PartComplete { part_index: 1, .. }) {
                    control.cancel();
                    break;
                }
            }
        });
    }

    let manifest = Manifest::new(
        server.uri(),
        "MS",
        (1..=4)
            .map(|n| PageDescriptor::DirectImage {
                url: format!("{}/p{n}.jpg", server.uri()),
                referer: None,
                headers: vec![],
            })
            .collect(),
    )
    .unwrap();

    let result = dl.run_job(manifest, &control).await.unwrap();
    assert!(result.cancelled);
    assert!(
        result.succeeded_pages >= 2,
        "the finished part's pages must survive cancellation"
    );
    assert!(
        result
            .parts
            .first()
            .map(|p| p.succeeded_pages == 2)
            .unwrap_or(false),
        "part 1 completed before the cancel"
    );
}

#[tokio::test]
async fn transient_errors_recover_within_the_retry_budget() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/p1.jpg"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(2)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/p1.jpg"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"finally".to_vec()))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let dl = downloader(&dir, 1, 100).await;
    let resolver = DirectResolver::new(1);
    let manifest = dl.resolve_manifest(&resolver, &server.uri()).await.unwrap();
    let result = dl.run_job(manifest, &JobControl::new()).await.unwrap();

    assert_eq!(result.succeeded_pages, 1);
    assert_eq!(result.parts[0].pages[0].bytes, b"finally");
    assert_eq!(server.received_requests().await.unwrap().len(), 3);
}
