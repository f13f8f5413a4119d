#![cfg(unix)]

use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use image::Rgba;
use slide_cache::render::{
    Budget, CacheManager, DocumentLayout, ExternalRenderer, FitMode, PagePart, PageRenderer,
    PageSize, RasterImage, RenderConfig, RenderError, StaticLayout, ViewportSize, encode_png,
};
use tempfile::TempDir;

fn layout() -> Arc<dyn DocumentLayout> {
    Arc::new(StaticLayout::uniform(4, PageSize::new(40.0, 30.0)))
}

fn args(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| (*s).to_string()).collect()
}

/// Write a small PNG standing in for the document
fn sample_png(dir: &Path) -> std::path::PathBuf {
    let image = RasterImage::from_pixel(12, 9, Rgba([200, 30, 30, 255]));
    let path = dir.join("slide.png");
    fs::write(&path, encode_png(&image).expect("encode")).expect("write sample");
    path
}

/// `sh -c` script that ignores the page and prints the document itself
fn cat_renderer(file: &Path) -> ExternalRenderer {
    ExternalRenderer::new("sh", &args(&["-c", "cat \"$0\"", "%file", "%page"]), file, layout())
        .expect("valid renderer")
}

#[test]
fn test_program_output_is_decoded() {
    let dir = TempDir::new().unwrap();
    let file = sample_png(dir.path());
    let renderer = cat_renderer(&file);

    let image = renderer.render(1, 2.0).expect("render through sh");
    assert_eq!(image.dimensions(), (12, 9));
    assert_eq!(image.get_pixel(0, 0), &Rgba([200, 30, 30, 255]));

    let bytes = renderer.render_compressed(1, 2.0).expect("raw output");
    assert_eq!(bytes, fs::read(&file).unwrap(), "PNG output is passed through as is");
}

#[test]
fn test_non_png_output_is_rejected() {
    let dir = TempDir::new().unwrap();
    let file = sample_png(dir.path());
    let renderer = ExternalRenderer::new(
        "sh",
        &args(&["-c", "echo page $1 of $0", "%file", "%page"]),
        &file,
        layout(),
    )
    .unwrap();

    assert!(matches!(renderer.render_compressed(0, 1.0), Err(RenderError::Engine { .. })));
}

#[test]
fn test_failing_program_reports_exit_status() {
    let dir = TempDir::new().unwrap();
    let file = sample_png(dir.path());
    let renderer = ExternalRenderer::new(
        "sh",
        &args(&["-c", "echo broken >&2; exit 3", "%file", "%page"]),
        &file,
        layout(),
    )
    .unwrap();

    match renderer.render_compressed(0, 1.0) {
        Err(RenderError::Engine { detail }) => {
            assert!(detail.contains("broken"), "stderr missing from '{detail}'");
        }
        other => panic!("expected engine error, got {other:?}"),
    }
}

#[test]
fn test_slow_program_times_out() {
    let dir = TempDir::new().unwrap();
    let file = sample_png(dir.path());
    let renderer = ExternalRenderer::new(
        "sh",
        &args(&["-c", "sleep 5", "%file", "%page"]),
        &file,
        layout(),
    )
    .unwrap()
    .with_timeout(Duration::from_millis(100));

    assert!(matches!(
        renderer.render_compressed(2, 1.0),
        Err(RenderError::Timeout { page: 2, .. })
    ));
}

#[test]
fn test_cache_workers_run_external_program() {
    let dir = TempDir::new().unwrap();
    let file = sample_png(dir.path());
    let config = RenderConfig::new(FitMode::Page, PagePart::FullPage, ViewportSize::new(80.0, 60.0));

    let mut cache = CacheManager::new(layout(), 2, config, |_| Ok(cat_renderer(&file)))
        .expect("cache should start");
    cache.set_budget(Budget::new(None, Some(3)));
    cache.on_current_page_changed(0);
    assert!(cache.run_until_idle(Duration::from_secs(10)));

    assert_eq!(cache.cached_pages(), vec![0, 1, 2]);
    let expected = fs::metadata(&file).unwrap().len() as i64;
    assert_eq!(cache.used_memory_bytes(), 3 * expected);
}
