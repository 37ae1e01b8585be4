//! Binary framing of DICOM pixel data.
//!
//! - The [`layout`] module
//!   describes how native samples are laid out
//!   (bits allocated and stored, signedness, planes and frames)
//!   and validates pixel data lengths against it.
//! - The [`codec`] module
//!   unpacks samples of any width from 1 to 16 bits
//!   into a [`PixelSampleBuffer`], and packs them back.
//! - The [`fragments`] module
//!   indexes the fragments of encapsulated pixel data lazily,
//!   locating the fragments of each frame.
//!
//! # Example
//!
//! ```
//! use dicomnet_pixeldata::{codec, PixelLayout, PixelRepresentation};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let layout = PixelLayout::new(1, 2, 16)
//!     .with_bits_stored(12, 11)
//!     .with_pixel_representation(PixelRepresentation::Signed)
//!     .validate()?;
//! let buffer = codec::decode(&[0x00, 0x08, 0xFF, 0x07], &layout, false)?;
//! assert_eq!(buffer.samples(), &[-2048, 2047]);
//! # Ok(())
//! # }
//! ```

pub mod buffer;
pub mod codec;
pub mod fragments;
pub mod layout;

pub use buffer::PixelSampleBuffer;
pub use codec::{BitPacker, BitUnpacker};
pub use fragments::{Compression, FragmentIndex, StreamSegment};
pub use layout::{PixelLayout, PixelRepresentation, PlanarConfiguration};
