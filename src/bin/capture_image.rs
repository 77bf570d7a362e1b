use std::sync::Arc;
use std::time::Duration;

use chrono::offset::Local;
use chrono::DateTime;
use clap::Parser;
use env_logger;
use log::info;

use camera_acquisition::abstract_camera::{CaptureMode, PropertyId};
use camera_acquisition::controller::{AcquisitionController, ControllerConfig};
use camera_acquisition::display::{DisplayUpdate, LogStatus, display_channel};
use camera_acquisition::image_camera::{ImageCameraApi, gradient_image};

/// Runs an acquisition against the simulated camera and saves the last
/// displayed (windowed) frame.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about=None)]
struct Args {
    /// Output image file; the format follows the extension.
    #[arg(short, long)]
    output: String,

    /// Image served by the simulated camera. Defaults to a horizontal ramp.
    #[arg(short, long)]
    source: Option<String>,

    /// Bits per channel delivered by the simulated camera.
    #[arg(long, default_value_t = 12,
          value_parser = clap::value_parser!(i32).range(8..=16))]
    bits: i32,

    /// Number of frames in the ring buffer; a snap captures this many.
    #[arg(long, default_value_t = 3)]
    frames: i32,

    #[arg(long, default_value_t = 10)]
    exposure_ms: u64,

    /// Run a continuous (Sequence) capture for this long instead of a snap.
    #[arg(long)]
    live_ms: Option<u64>,

    #[arg(long, default_value_t = 0)]
    lut_min: u32,

    #[arg(long, default_value_t = 65535)]
    lut_max: u32,
}

#[tokio::main]
async fn main() {
    // If any thread panics, bail out.
    std::panic::set_hook(Box::new(|panic_info| {
        eprintln!("Thread panicked: {}", panic_info);
        std::process::exit(1);
    }));
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let image = match &args.source {
        Some(path) => image::open(path).unwrap().into_luma16(),
        None => gradient_image(640, 480, ((1u32 << args.bits) - 1) as u16),
    };
    let api = Arc::new(ImageCameraApi::new(vec![image], args.bits));
    let config = ControllerConfig{frame_count: args.frames,
                                  lut_min: args.lut_min,
                                  lut_max: args.lut_max,
                                  ..Default::default()};
    let (display, mut updates) = display_channel();
    let mut controller = AcquisitionController::new(
        api, config, Arc::new(display), Arc::new(LogStatus));

    controller.init().await.unwrap();
    controller.open().await.unwrap();
    info!("camera: {:?}", controller.info().await.unwrap());
    controller.set_property(PropertyId::ExposureTime,
                            args.exposure_ms as f64 / 1000.0).await.unwrap();

    match args.live_ms {
        Some(live_ms) => {
            controller.start(CaptureMode::Sequence).await.unwrap();
            tokio::time::sleep(Duration::from_millis(live_ms)).await;
        },
        None => {
            controller.start(CaptureMode::Snap).await.unwrap();
            let exit = controller.wait_for_capture_end(Duration::from_secs(10)).await;
            info!("Snap capture loop exit: {:?}", exit);
        },
    }
    controller.stop().await.unwrap();

    let stats = controller.frame_rate();
    info!("{} frames ({} displayed, {} skipped), average {:.1} fps",
          stats.total_frames, stats.displayed_frames, stats.skipped_frames,
          stats.average_rate().unwrap_or(0.0));

    // Keep the last picture the display would be showing.
    let mut last_frame = None;
    while let Ok(update) = updates.try_recv() {
        match update {
            DisplayUpdate::Frame(frame) => last_frame = Some(frame),
            DisplayUpdate::Clear => last_frame = None,
        }
    }
    let frame = last_frame.expect("No frame was displayed");
    frame.image.save(&args.output).unwrap();

    let datetime: DateTime<Local> = frame.timestamp.into();
    info!("Frame {} obtained at {}", frame.frame_index, datetime.format("%d/%m/%Y %T"));

    controller.close().await.unwrap();
    controller.uninit().await.unwrap();
}
