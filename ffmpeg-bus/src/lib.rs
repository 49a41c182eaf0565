/// Registers FFmpeg components (formats, codecs, network). Call once at startup
/// before opening any input or output.
pub fn init() -> anyhow::Result<()> {
    ffmpeg_next::init().map_err(|e| anyhow::anyhow!("ffmpeg_next init: {}", e))?;
    ffmpeg_next::format::network::init();
    Ok(())
}

pub mod bsf;
pub mod decoder;
pub mod encoder;
pub mod fmp4;
pub mod input;
pub mod output;
pub mod packet;
pub mod params;
pub mod picture;
pub mod scaler;
pub mod stream;
