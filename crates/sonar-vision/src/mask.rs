use image::imageops::FilterType;
use image::{GrayImage, Luma, RgbaImage};

/// Enlarge a capture by an integer factor with bilinear filtering.
pub fn upscale(img: &RgbaImage, factor: u32) -> RgbaImage {
    if factor <= 1 {
        return img.clone();
    }
    image::imageops::resize(
        img,
        img.width() * factor,
        img.height() * factor,
        FilterType::Triangle,
    )
}

/// Binary mask of pixels whose R, G and B are all at least `threshold`.
/// Foreground is 255, background 0.
pub fn white_mask(img: &RgbaImage, threshold: u8) -> GrayImage {
    GrayImage::from_fn(img.width(), img.height(), |x, y| {
        let p = img.get_pixel(x, y);
        if p[0] >= threshold && p[1] >= threshold && p[2] >= threshold {
            Luma([255])
        } else {
            Luma([0])
        }
    })
}
