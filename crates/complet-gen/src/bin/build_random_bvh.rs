//! Generate a random BVH and write its serialized bytes to disk.
//!
//! Usage: `build_random_bvh [key=value ...] <output>`
//!
//! Keys: seed, width, depth, prob_split, triangle_count, group_size,
//! precision, motion_blur, shear, visibility_opacity, use_micromesh,
//! target (gen1/gen2/gen3), relative_leaf_pointers,
//! relative_complet_pointers, base_address.

use std::fs::File;
use std::io::Write;
use std::path::PathBuf;
use std::str::FromStr;

use complet_encode::Target;
use complet_gen::{BuildParams, build_random_bvh};
use tracing::info;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let mut params = BuildParams::default();
    let mut base_address = 0u64;
    let mut output = None;

    for arg in std::env::args().skip(1) {
        let Some((key, value)) = arg.split_once('=') else {
            output = Some(PathBuf::from(arg));
            continue;
        };
        match key {
            "seed" => params.seed = parse(key, value)?,
            "width" => params.width = parse(key, value)?,
            "depth" => params.depth = parse(key, value)?,
            "prob_split" => params.prob_split = parse(key, value)?,
            "triangle_count" => params.triangle_count = parse(key, value)?,
            "group_size" => params.group_size = parse(key, value)?,
            "precision" => params.precision = parse(key, value)?,
            "motion_blur" => params.motion_blur = parse(key, value)?,
            "shear" => params.shear = parse(key, value)?,
            "visibility_opacity" => params.visibility_opacity = parse(key, value)?,
            "use_micromesh" => params.use_micromesh = parse(key, value)?,
            "relative_leaf_pointers" => params.relative_leaf_pointers = parse(key, value)?,
            "relative_complet_pointers" => params.relative_complet_pointers = parse(key, value)?,
            "base_address" => base_address = parse(key, value)?,
            "target" => params.target = parse_target(value)?,
            _ => return Err(format!("unknown key {key:?}").into()),
        }
    }
    let output = output.ok_or("missing output path")?;

    let (bvh, counts) = build_random_bvh(&params)?;
    let bytes = bvh.serialize(base_address)?;
    File::create(&output)?.write_all(&bytes)?;

    info!(
        complets = counts.complets,
        batches = counts.batches,
        micromeshes = counts.micromeshes,
        triangles = counts.triangles,
        bytes = bytes.len(),
        path = %output.display(),
        "wrote bvh"
    );
    Ok(())
}

fn parse<T>(key: &str, value: &str) -> Result<T, Box<dyn std::error::Error>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value
        .parse()
        .map_err(|err| format!("invalid value {value:?} for {key}: {err}").into())
}

fn parse_target(value: &str) -> Result<Target, Box<dyn std::error::Error>> {
    match value {
        "gen1" => Ok(Target::Gen1),
        "gen2" => Ok(Target::Gen2),
        "gen3" => Ok(Target::Gen3),
        _ => Err(format!("unknown target {value:?}").into()),
    }
}
