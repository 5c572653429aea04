//! This crate provides XWD (X Window Dump) support for the image crate, and
//! optionally screen capture through the X11 `xwd` tool.
//!
//! The enabled parts are controlled via Cargo features:
//! ```toml
//! [dependencies]
//! image-xwd = { version = "0.1", features = ["capture"] }
//! ```
//!
//! To open `.xwd` files through the image crate, call the `register` function at
//! program startup:
//!
//!  ```rust,no_run
//! image_xwd::register();
//!
//! // Now you can use the image crate as normal
//! let img = image::open("path/to/dump.xwd").unwrap();
//! ```
//!
//! The decoder can also be used directly on any buffered stream:
//!
//!  ```rust,no_run
//! let file = std::io::BufReader::new(std::fs::File::open("dump.xwd").unwrap());
//! let img = image_xwd::xwd::decode(file).unwrap();
//! ```

#![forbid(unsafe_code)]

#[cfg(feature = "xwd")]
pub mod xwd;

#[cfg(feature = "capture")]
pub mod capture;

#[allow(unused_imports)]
use image::hooks::{register_decoding_hook, register_format_detection_hook};

static REGISTER: std::sync::Once = std::sync::Once::new();

/// Register all enabled extra formats with the image crate.
pub fn register() {
    REGISTER.call_once(|| {
        // XWD files start with the variable header size, so the signature is the
        // file version (7) and pixmap format (ZPixmap) that follow it
        #[cfg(feature = "xwd")]
        if register_decoding_hook(
            "xwd".into(),
            Box::new(|r| Ok(Box::new(xwd::XwdDecoder::new(r)?))),
        ) {
            register_format_detection_hook(
                "xwd".into(),
                b"\0\0\0\0\0\0\0\x07\0\0\0\x02",
                Some(b"\0\0\0\0\xFF\xFF\xFF\xFF\xFF\xFF\xFF\xFF"),
            );
        }
    });
}
