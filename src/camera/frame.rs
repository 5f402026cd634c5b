use std::sync::Arc;

/// Low-resolution RGB24 frame published by the camera for vision motion
#[derive(Clone, Debug)]
pub struct PreviewFrame {
    pub seq: u64,
    pub width: u32,
    pub height: u32,
    pub rgb: Arc<[u8]>,
}

impl PreviewFrame {
    pub fn byte_len(width: u32, height: u32) -> usize {
        width as usize * height as usize * 3
    }

    /// Luma of the pixel at (x, y)
    pub fn gray(&self, x: u32, y: u32) -> f32 {
        let i = (y as usize * self.width as usize + x as usize) * 3;
        0.2989 * self.rgb[i] as f32 + 0.5870 * self.rgb[i + 1] as f32 + 0.1140 * self.rgb[i + 2] as f32
    }
}
