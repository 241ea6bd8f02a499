//! Run Script Example: executes a small Python function in a sandbox.
//!
//! Needs a built runtime bundle:
//!
//! ```shell
//! export ISOLA_PYTHON_RUNTIME=/path/to/runtime   # contains python3.wasm + lib/
//! cargo run --example run_script
//! ```

#![allow(clippy::disallowed_macros)]

use isola::{Context, ContextPatch, Event, RunArg, SandboxPatch};
use serde_json::json;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let runtime_dir = std::env::var("ISOLA_PYTHON_RUNTIME")
        .map_err(|_| anyhow::anyhow!("set ISOLA_PYTHON_RUNTIME to the runtime bundle directory"))?;

    let context = Context::new();
    context.configure(
        ContextPatch::default()
            .max_memory(64 * 1024 * 1024)
            .runtime_lib_dir(format!("{runtime_dir}/lib")),
    )?;
    context.initialize_template(runtime_dir.as_str()).await?;

    let sandbox = context.instantiate().await?;
    sandbox.configure(SandboxPatch::default().timeout_secs(5.0))?;
    sandbox.set_callback(|event: Event| {
        println!("event: {} {:?}", event.kind.as_str(), event.data);
    });

    sandbox.start().await?;
    sandbox
        .load_script("def greet(name):\n\tprint('called')\n\treturn f'hello {name}'\n")
        .await?;

    let result = sandbox
        .run("greet", vec![RunArg::from(json!("world"))])
        .await?;
    println!("final: {:?}", result.final_value);
    println!("stdout: {:?}", result.stdout);

    sandbox.close().await;
    context.close().await;
    Ok(())
}
