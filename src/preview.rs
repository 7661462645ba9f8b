// src/preview.rs

use anyhow::Result;
use opencv::{core::Mat, highgui, prelude::*};

use crate::types::Frame;

const WINDOW_NAME: &str = "vision-streamer";
const QUIT_KEY: i32 = 'q' as i32;

/// Optional on-screen preview of annotated frames. The `q` key requests
/// shutdown through the same path as a termination signal.
pub struct Preview {
    open: bool,
}

impl Preview {
    pub fn open() -> Result<Self> {
        highgui::named_window(WINDOW_NAME, highgui::WINDOW_AUTOSIZE)?;
        Ok(Self { open: true })
    }

    /// Render the frame; returns true when the user requested shutdown.
    pub fn show(&mut self, frame: &Frame) -> Result<bool> {
        let mat = Mat::from_slice(&frame.data)?;
        let mat = mat.reshape(3, frame.height as i32)?;
        highgui::imshow(WINDOW_NAME, &mat)?;
        let key = highgui::wait_key(1)?;
        Ok(key == QUIT_KEY)
    }

    /// Idempotent teardown of the preview surface.
    pub fn close(&mut self) {
        if !self.open {
            return;
        }
        self.open = false;
        let _ = highgui::destroy_all_windows();
    }
}

impl Drop for Preview {
    fn drop(&mut self) {
        self.close();
    }
}
