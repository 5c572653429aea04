#![no_main]
#[macro_use]
extern crate libfuzzer_sys;

use image::ImageDecoder;

fuzz_target!(|data: &[u8]| {
    // Plain slices are not seekable, like the pipes the decoder is meant for
    let Ok(mut decoder) = image_xwd::xwd::XwdDecoder::new(data) else {
        return;
    };
    let mut limits = image::Limits::default();
    limits.max_alloc = Some(1024 * 1024); // 1 MiB
    if limits.reserve(decoder.total_bytes()).is_err() {
        return;
    }
    if decoder.set_limits(limits).is_err() {
        return;
    }
    let _ = std::hint::black_box(image::DynamicImage::from_decoder(decoder));
});
