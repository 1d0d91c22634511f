//! Benchmark tests for castello-core hot paths
//!
//! Run with: cargo bench -p castello-core

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use std::sync::Arc;

use castello_core::drm::{HttpLicenseTransport, LicenseTransport, PlayReady, KeySystemAdapter};
use castello_core::intercept::LoadRequestData;
use castello_core::loader::derive_source;
use castello_core::seek::{normalize, strip_trim_params};
use castello_core::types::*;
use castello_core::ReceiverConfig;

// ============================================================================
// Seek Normalization Benchmarks
// ============================================================================

fn bench_seek_normalization(c: &mut Criterion) {
    let mut group = c.benchmark_group("Seek Normalization");

    for (name, raw, duration) in [("seconds", 45.0, 90.0), ("milliseconds", 95_000.0, 90.0), ("unknown_duration", 30.0, 0.0)] {
        group.bench_with_input(BenchmarkId::new("normalize", name), &(raw, duration), |b, &(raw, duration)| {
            b.iter(|| black_box(normalize(black_box(raw), black_box(duration), false)))
        });
    }

    group.bench_function("strip_trim_params", |b| {
        let url = "https://cdn.example.com/live/manifest.mpd?start=1700000000&end=1700003600&token=abc";
        b.iter(|| black_box(strip_trim_params(black_box(url))))
    });

    group.bench_function("strip_without_query", |b| {
        let url = "https://cdn.example.com/vod/manifest.mpd";
        b.iter(|| black_box(strip_trim_params(black_box(url))))
    });

    group.finish();
}

// ============================================================================
// Source Derivation Benchmarks
// ============================================================================

fn bench_source_derivation(c: &mut Criterion) {
    let mut group = c.benchmark_group("Source Derivation");

    for content_type in ["application/dash+xml", "application/x-mpegurl; hls", "application/vnd.ms-sstr+xml", "video/mp4"] {
        group.bench_with_input(BenchmarkId::new("container_type", content_type), content_type, |b, ct| {
            b.iter(|| black_box(ContainerType::from_content_type(black_box(ct))))
        });
    }

    let config = ReceiverConfig::default();
    let transport: Arc<dyn LicenseTransport> = Arc::new(HttpLicenseTransport::new(&config).unwrap());
    let drm = DrmCustomData::from_parts(Some("https://lic.example.com/v1"), Some("m1"), Some("ticket"), None).unwrap();
    let command = LoadCommand::new("https://cdn.example.com/a.mpd", "application/dash+xml").with_drm(drm);

    group.bench_function("derive_drm_source", |b| {
        b.iter(|| black_box(derive_source(black_box(&command), Arc::clone(&transport), &config, None).unwrap()))
    });

    let raw = r#"{"currentTime": 95000, "media": {"contentUrl": "https://cdn.example.com/a.mpd",
        "contentType": "application/dash+xml", "duration": 5400,
        "customData": {"licenseServerURL": "https://lic.example.com/v1", "mediaId": "m1", "drmTicket": "t", "token": "tok"}}}"#;
    group.bench_function("parse_load_request", |b| {
        b.iter(|| black_box(LoadRequestData::from_json(black_box(raw)).unwrap().to_command().unwrap()))
    });

    group.finish();
}

// ============================================================================
// Key Message Benchmarks
// ============================================================================

fn bench_key_messages(c: &mut Criterion) {
    let mut group = c.benchmark_group("Key Messages");

    let envelope = "<PlayReadyKeyMessage type=\"LicenseAcquisition\"><LicenseAcquisition Version=\"1\">\
        <Challenge encoding=\"base64encoded\">PHNvYXA6RW52ZWxvcGU+PC9zb2FwOkVudmVsb3BlPg==</Challenge>\
        <HttpHeaders><HttpHeader><name>Content-Type</name><value>text/xml; charset=utf-8</value></HttpHeader>\
        <HttpHeader><name>SOAPAction</name><value>AcquireLicense</value></HttpHeader></HttpHeaders>\
        </LicenseAcquisition></PlayReadyKeyMessage>";
    let utf16: Vec<u8> = envelope.encode_utf16().flat_map(|u| u.to_le_bytes()).collect();

    group.bench_function("playready_utf16_unwrap", |b| {
        b.iter(|| black_box(PlayReady.build_license_request(black_box(&utf16)).unwrap()))
    });

    group.finish();
}

criterion_group!(seek_benches, bench_seek_normalization);

criterion_group!(source_benches, bench_source_derivation);

criterion_group!(key_message_benches, bench_key_messages);

criterion_main!(seek_benches, source_benches, key_message_benches);
