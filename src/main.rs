// squall launcher
//
// Thin binary over the library: one positional argument naming the
// level file, exit 0 on clean shutdown, nonzero on any init failure.
//
// Austin Shafer - 2025
use anyhow::{bail, Context};

use squall::frame::{FrameLoop, ShaderPaths};
use squall::platform::DirectDisplayBackend;
use squall::Config;

use std::path::PathBuf;

fn main() -> anyhow::Result<()> {
    env_logger::init();

    let mut args = std::env::args().skip(1);
    let level_path = match args.next() {
        Some(p) => PathBuf::from(p),
        None => bail!("usage: squall <level-file>"),
    };
    if !level_path.is_file() {
        bail!("level file {:?} does not exist", level_path);
    }

    // The launcher config collaborator normally fills this in from
    // the user's JSON; defaults are enough to bring the core up.
    let config = Config::default();

    let shaders = ShaderPaths {
        cull: PathBuf::from("shaders/gpu_cull.comp.spv"),
        vert: PathBuf::from("shaders/scene.vert.spv"),
        frag: PathBuf::from("shaders/scene.frag.spv"),
    };

    let backend = Box::new(DirectDisplayBackend::new());
    let mut frame_loop = FrameLoop::new(
        config, backend, &shaders, 64,   // distinct (mesh, material) batches
        1024, // dynamic instances per frame
    )
    .context("engine initialization failed")?;

    // The level loader populates the render system here; with no
    // scene attached we still bring up the full frame pipeline.
    log::info!("Loading level {:?}", level_path);
    frame_loop.finalize_scene(&[])?;

    frame_loop.run().context("render loop failed")?;
    Ok(())
}
