use utoipa::OpenApi;

fn main() -> std::io::Result<()> {
    let doc = relay_server::routes::ApiDoc::openapi()
        .to_pretty_json()
        .map_err(std::io::Error::other)?;
    let out = std::path::Path::new(env!("CARGO_MANIFEST_DIR")).join("../../specs/relay-server.json");
    if let Some(parent) = out.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(&out, doc)?;
    println!("Wrote {}", out.display());
    Ok(())
}
