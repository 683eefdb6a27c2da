//! Load the fixture backends, inspect them and save the snapshot to
//! `inspect_output.json`.

use polyinspect::harness::{node_loader, python_loader};
use polyinspect::serial;
use polyinspect::Runtime;
use std::fs;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let runtime = Runtime::new();
    runtime.register_loader(python_loader());
    runtime.register_loader(node_loader());
    runtime.initialize()?;

    for (tag, script) in [("py", "test.py"), ("node", "test.js")] {
        if let Err(err) = runtime.load_from_file(tag, &[script]) {
            eprintln!("Warning: failed to load {script} with the {tag} loader: {err}");
        }
    }

    let snapshot = runtime.inspect(None)?;
    fs::write("inspect_output.json", snapshot.as_bytes())?;
    println!(
        "Wrote {} bytes to inspect_output.json",
        snapshot.len()
    );
    snapshot.release()?;

    let pretty = serial::serialize_pretty(&runtime.registry_view()?)?;
    println!("{}", String::from_utf8_lossy(&pretty));

    runtime.destroy();
    Ok(())
}
