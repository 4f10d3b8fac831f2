use ps2gs_hw::WgpuBackend;

fn require_wgpu() -> bool {
    let Ok(raw) = std::env::var("PS2GS_REQUIRE_WGPU") else {
        return false;
    };
    let v = raw.trim();
    v == "1" || v.eq_ignore_ascii_case("true") || v.eq_ignore_ascii_case("yes")
}

pub fn skip_or_panic(test_name: &str, reason: &str) {
    if require_wgpu() {
        panic!("PS2GS_REQUIRE_WGPU is enabled but {test_name} cannot run: {reason}");
    }
    eprintln!("skipping {test_name}: {reason}");
}

/// Headless backend, or `None` (after logging) when no adapter is usable.
pub fn headless_backend(test_name: &str) -> Option<WgpuBackend> {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();

    match pollster::block_on(WgpuBackend::new_headless()) {
        Ok(backend) => Some(backend),
        Err(err) => {
            skip_or_panic(test_name, &format!("wgpu backend init failed: {err}"));
            None
        }
    }
}
