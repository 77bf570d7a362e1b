// Copyright (c) 2023 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use clap::Parser;
use env_logger;

use camera_acquisition::abstract_camera::{CameraApi, PropertyId};
use camera_acquisition::image_camera::{ImageCameraApi, gradient_image};

/// Lists the devices of the simulated camera driver.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about=None)]
struct Args {
    /// Number of simulated devices.
    #[arg(short, long, default_value_t = 2)]
    count: usize,

    #[arg(long, default_value_t = 12,
          value_parser = clap::value_parser!(i32).range(8..=16))]
    bits: i32,
}

fn main() {
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let max_value = ((1u32 << args.bits) - 1) as u16;
    let images = (0..args.count).map(|_| gradient_image(640, 480, max_value)).collect();
    let api = ImageCameraApi::new(images, args.bits);

    let num_cameras = api.init().unwrap();
    println!("Found {} cameras: ", num_cameras);
    for i in 0..num_cameras {
        let camera = api.open(i).unwrap();
        let info = camera.model_info().unwrap();
        let width = camera.get_property(PropertyId::ImageWidth).unwrap();
        let height = camera.get_property(PropertyId::ImageHeight).unwrap();
        println!("{}: {:?} {}x{}", i, info, width, height);
        camera.close().unwrap();
    }
    api.uninit().unwrap();
}
