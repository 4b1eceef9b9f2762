#[test]
fn reduction_wgsl_sources_parse_successfully() {
    parse_wgsl("reduce_seed.wgsl", include_str!("reduce_seed.wgsl"));
    parse_wgsl("reduce_step.wgsl", include_str!("reduce_step.wgsl"));
}

fn parse_wgsl(label: &str, source: &str) {
    naga::front::wgsl::parse_str(source).unwrap_or_else(|error| {
        panic!(
            "WGSL parse failed for {label}: {}",
            error.emit_to_string(source)
        )
    });
}
