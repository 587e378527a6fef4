use std::io::Cursor;

use anyhow::Result;
use candle_core::utils::{cuda_is_available, metal_is_available};
use candle_core::{DType, Device, Tensor};
use image::imageops::FilterType;
use image::{GrayImage, ImageFormat, RgbImage};
use tracing::info;

use crate::DeviceMap;

pub fn select_best_device(device_map: DeviceMap) -> Result<Device> {
    match device_map {
        DeviceMap::ForceCpu => Ok(Device::Cpu),
        DeviceMap::Ordinal(ordinal) if cuda_is_available() => Ok(Device::new_cuda(ordinal)?),
        DeviceMap::Ordinal(ordinal) if metal_is_available() => Ok(Device::new_metal(ordinal)?),
        DeviceMap::Ordinal(_) => {
            #[cfg(all(target_os = "macos", target_arch = "aarch64"))]
            {
                info!("running on CPU, to run on GPU (metal) build with `--features metal`");
            }
            #[cfg(not(all(target_os = "macos", target_arch = "aarch64")))]
            {
                info!("running on CPU, to run on GPU build with `--features cuda`");
            }
            Ok(Device::Cpu)
        }
    }
}

/// Converts a u8 tensor with shape (3, height, width) into an RGB image.
pub fn tensor_to_image(img: &Tensor) -> Result<RgbImage> {
    let (channels, height, width) = img.dims3()?;
    if channels != 3 {
        anyhow::bail!("tensor_to_image expects an image with 3 channels, got {channels}");
    }
    let img = img.permute((1, 2, 0))?.flatten_all()?;
    let pixels = img.to_vec1::<u8>()?;
    RgbImage::from_raw(width as u32, height as u32, pixels)
        .ok_or_else(|| anyhow::anyhow!("error converting tensor to image buffer"))
}

/// Resizes `img` and maps it to a (1, 3, height, width) tensor in [-1, 1].
pub fn image_to_tensor(img: &RgbImage, width: usize, height: usize, device: &Device) -> Result<Tensor> {
    let img = image::imageops::resize(img, width as u32, height as u32, FilterType::CatmullRom);
    let tensor = Tensor::from_vec(img.into_raw(), (height, width, 3), &Device::Cpu)?
        .permute((2, 0, 1))?
        .to_dtype(DType::F32)?
        .affine(2. / 255., -1.)?
        .unsqueeze(0)?;
    Ok(tensor.to_device(device)?)
}

/// Maps an inpainting mask to a (1, 1, height, width) keep-weight tensor:
/// 0 where the mask is white (repaint), 1 where it is black (keep).
pub fn mask_to_keep_tensor(
    mask: &GrayImage,
    width: usize,
    height: usize,
    device: &Device,
) -> Result<Tensor> {
    let mask = image::imageops::resize(mask, width as u32, height as u32, FilterType::Nearest);
    let tensor = Tensor::from_vec(mask.into_raw(), (1, 1, height, width), &Device::Cpu)?
        .to_dtype(DType::F32)?
        .affine(-1. / 255., 1.)?;
    Ok(tensor.to_device(device)?)
}

/// Encodes an image as PNG bytes.
pub fn encode_png(img: &RgbImage) -> Result<Vec<u8>> {
    let mut bytes = Vec::new();
    img.write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)?;
    Ok(bytes)
}
