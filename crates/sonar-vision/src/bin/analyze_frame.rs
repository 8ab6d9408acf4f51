//! CLI tool to run a saved screenshot through the localization sensors.
//! Usage: cargo run -p sonar-vision --features cli --bin analyze_frame -- <screenshot.png> [output_dir]

use anyhow::{Context, Result};
use sonar_capture::{crop_region, FrameSampler};
use sonar_data::NavConfig;
use sonar_vision::{IconDetector, IconLocalizer, MapMatcher, MatcherConfig, MinimapLocalizer, PpiLocalizer};
use std::path::PathBuf;
use std::sync::Arc;

fn main() -> Result<()> {
    // Initialize tracing for debug output
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .init();

    let args: Vec<String> = std::env::args().collect();
    if args.len() < 2 {
        eprintln!("Usage: {} <screenshot.png> [output_dir]", args[0]);
        std::process::exit(1);
    }

    let input_path = PathBuf::from(&args[1]);
    let output_dir = if args.len() >= 3 {
        PathBuf::from(&args[2])
    } else {
        PathBuf::from("./debug_output")
    };
    let _ = std::fs::create_dir_all(&output_dir);

    let config = NavConfig::load(&NavConfig::default_path())?;
    let profile = config.current_profile();

    println!("Loading image: {}", input_path.display());
    let img = image::open(&input_path)
        .with_context(|| format!("Failed to open {}", input_path.display()))?
        .to_rgba8();
    println!("Image size: {}x{}", img.width(), img.height());
    println!("Active map: {}", profile.name);

    for (name, region) in [
        ("map_roi", profile.roi),
        ("minimap_icon", profile.minimap.region),
        ("ppi_patch", profile.ppi_capture),
    ] {
        match crop_region(&img, &region) {
            Ok(crop) => {
                let _ = crop.save(output_dir.join(format!("{}.png", name)));
            }
            Err(e) => println!("{}: {:#}", name, e),
        }
    }

    let sampler = Arc::new(FrameSampler::new(img));

    println!("\n=== Full map icon ===");
    let icon = IconLocalizer::new(
        sampler.clone(),
        profile.roi,
        IconDetector::from_detection(&config.detection),
    );
    let pose = icon.locate();
    match (pose.position, pose.heading) {
        (Some(p), Some(h)) => println!("Position: ({:.0}, {:.0}) facing {:.1}", p.x, p.y, h),
        _ => println!("Icon: NOT FOUND"),
    }

    println!("\n=== Minimap heading ===");
    let minimap = MinimapLocalizer::new(sampler.clone(), &profile.minimap);
    match minimap.heading() {
        Some(h) => println!(
            "Heading: {:.1} ({})",
            h,
            sonar_state::cardinal_direction(h)
        ),
        None => println!("Minimap icon: NOT FOUND"),
    }

    println!("\n=== Map matching ===");
    let map_path = config.map_image_path(&profile.name);
    if !map_path.exists() {
        println!("Reference map {} not found, skipping", map_path.display());
    } else {
        let ppi = PpiLocalizer::new(
            sampler,
            Arc::new(MapMatcher::new(MatcherConfig::from_ppi(&config.ppi))),
            profile.ppi_capture,
            profile.roi,
            profile.name.clone(),
            map_path,
        );
        match ppi.locate() {
            Some(p) => println!("Matched position: ({:.0}, {:.0})", p.x, p.y),
            None => println!("Map match: NOT FOUND"),
        }
    }

    println!("\nDebug images saved to: {}", output_dir.display());
    Ok(())
}
