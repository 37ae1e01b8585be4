//! Native pixel data layout.
//!
//! A [`PixelLayout`] holds the encoding parameters of one pixel data element,
//! which stay fixed for its whole lifetime.
use dicom_core::Tag;
use dicom_dictionary_std::tags;
use dicom_object::InMemDicomObject;
use snafu::{ensure, Backtrace, OptionExt, ResultExt, Snafu};

#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum LayoutError {
    #[snafu(display("Missing required attribute `{}`", name))]
    MissingAttribute {
        name: &'static str,
        backtrace: Backtrace,
    },

    #[snafu(display("Could not convert attribute `{}`", name))]
    ConvertAttribute {
        name: &'static str,
        source: dicom_core::value::ConvertValueError,
        backtrace: Backtrace,
    },

    #[snafu(display("Invalid Bits Allocated {}, must be between 1 and 16", bits_allocated))]
    InvalidBitsAllocated {
        bits_allocated: u16,
        backtrace: Backtrace,
    },

    #[snafu(display(
        "Invalid Bits Stored {} for Bits Allocated {}",
        bits_stored,
        bits_allocated
    ))]
    InvalidBitsStored {
        bits_stored: u16,
        bits_allocated: u16,
        backtrace: Backtrace,
    },

    #[snafu(display(
        "Invalid High Bit {} for Bits Stored {} and Bits Allocated {}",
        high_bit,
        bits_stored,
        bits_allocated
    ))]
    InvalidHighBit {
        high_bit: u16,
        bits_stored: u16,
        bits_allocated: u16,
        backtrace: Backtrace,
    },

    #[snafu(display("Invalid Pixel Representation {}, must be 0 or 1", value))]
    InvalidPixelRepresentation { value: u16, backtrace: Backtrace },

    #[snafu(display("Invalid Planar Configuration {}, must be 0 or 1", value))]
    InvalidPlanarConfiguration { value: u16, backtrace: Backtrace },

    /// Rows, columns, frames and samples per pixel must not be zero
    EmptyDimensions { backtrace: Backtrace },

    #[snafu(display(
        "Pixel data length {} does not match the expected length {}",
        actual,
        expected
    ))]
    LengthMismatch {
        expected: u64,
        actual: u64,
        backtrace: Backtrace,
    },
}

pub type Result<T, E = LayoutError> = std::result::Result<T, E>;

/// Whether stored samples are to be interpreted as two's complement.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum PixelRepresentation {
    Unsigned = 0,
    Signed = 1,
}

/// How the samples of multi-sample pixels are arranged.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum PlanarConfiguration {
    /// the samples of one pixel are together (R1 G1 B1 R2 G2 B2 ...)
    Interleaved = 0,
    /// one whole plane per sample (R1 R2 ... G1 G2 ... B1 B2 ...)
    Planar = 1,
}

/// The encoding parameters of a native pixel data element.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct PixelLayout {
    rows: u16,
    columns: u16,
    number_of_frames: u32,
    samples_per_pixel: u16,
    bits_allocated: u16,
    bits_stored: u16,
    high_bit: u16,
    pixel_representation: PixelRepresentation,
    planar_configuration: PlanarConfiguration,
}

impl PixelLayout {
    /// Create a single frame, single sample, unsigned layout
    /// with every allocated bit stored.
    ///
    /// Use the `with_*` methods to change the other parameters,
    /// then [`validate`](Self::validate).
    pub fn new(rows: u16, columns: u16, bits_allocated: u16) -> Self {
        PixelLayout {
            rows,
            columns,
            number_of_frames: 1,
            samples_per_pixel: 1,
            bits_allocated,
            bits_stored: bits_allocated,
            high_bit: bits_allocated.saturating_sub(1),
            pixel_representation: PixelRepresentation::Unsigned,
            planar_configuration: PlanarConfiguration::Interleaved,
        }
    }

    pub fn with_frames(mut self, number_of_frames: u32) -> Self {
        self.number_of_frames = number_of_frames;
        self
    }

    pub fn with_samples_per_pixel(mut self, samples_per_pixel: u16) -> Self {
        self.samples_per_pixel = samples_per_pixel;
        self
    }

    /// Set the stored bit window, ending at `high_bit`.
    pub fn with_bits_stored(mut self, bits_stored: u16, high_bit: u16) -> Self {
        self.bits_stored = bits_stored;
        self.high_bit = high_bit;
        self
    }

    pub fn with_pixel_representation(mut self, pixel_representation: PixelRepresentation) -> Self {
        self.pixel_representation = pixel_representation;
        self
    }

    pub fn with_planar_configuration(mut self, planar_configuration: PlanarConfiguration) -> Self {
        self.planar_configuration = planar_configuration;
        self
    }

    /// Check that the parameters describe a decodable layout.
    pub fn validate(self) -> Result<Self> {
        ensure!(
            (1..=16).contains(&self.bits_allocated),
            InvalidBitsAllocatedSnafu {
                bits_allocated: self.bits_allocated
            }
        );
        ensure!(
            self.bits_stored >= 1 && self.bits_stored <= self.bits_allocated,
            InvalidBitsStoredSnafu {
                bits_stored: self.bits_stored,
                bits_allocated: self.bits_allocated,
            }
        );
        ensure!(
            u32::from(self.high_bit) + 1 >= u32::from(self.bits_stored)
                && self.high_bit < self.bits_allocated,
            InvalidHighBitSnafu {
                high_bit: self.high_bit,
                bits_stored: self.bits_stored,
                bits_allocated: self.bits_allocated,
            }
        );
        ensure!(
            self.rows > 0
                && self.columns > 0
                && self.number_of_frames > 0
                && self.samples_per_pixel > 0,
            EmptyDimensionsSnafu
        );
        Ok(self)
    }

    /// Read the layout from the image pixel module attributes of a data set.
    pub fn from_object(obj: &InMemDicomObject) -> Result<Self> {
        let rows = required_u16(obj, tags::ROWS, "Rows")?;
        let columns = required_u16(obj, tags::COLUMNS, "Columns")?;
        let bits_allocated = required_u16(obj, tags::BITS_ALLOCATED, "BitsAllocated")?;
        let bits_stored = optional_u16(obj, tags::BITS_STORED, "BitsStored")?
            .unwrap_or(bits_allocated);
        let high_bit = optional_u16(obj, tags::HIGH_BIT, "HighBit")?
            .unwrap_or_else(|| bits_stored.saturating_sub(1));
        let samples_per_pixel =
            optional_u16(obj, tags::SAMPLES_PER_PIXEL, "SamplesPerPixel")?.unwrap_or(1);
        let number_of_frames = match obj.get(tags::NUMBER_OF_FRAMES) {
            Some(elem) => elem.to_int::<u32>().context(ConvertAttributeSnafu {
                name: "NumberOfFrames",
            })?,
            None => 1,
        };
        let pixel_representation =
            match optional_u16(obj, tags::PIXEL_REPRESENTATION, "PixelRepresentation")? {
                None | Some(0) => PixelRepresentation::Unsigned,
                Some(1) => PixelRepresentation::Signed,
                Some(value) => return InvalidPixelRepresentationSnafu { value }.fail(),
            };
        let planar_configuration =
            match optional_u16(obj, tags::PLANAR_CONFIGURATION, "PlanarConfiguration")? {
                None | Some(0) => PlanarConfiguration::Interleaved,
                Some(1) => PlanarConfiguration::Planar,
                Some(value) => return InvalidPlanarConfigurationSnafu { value }.fail(),
            };

        PixelLayout {
            rows,
            columns,
            number_of_frames,
            samples_per_pixel,
            bits_allocated,
            bits_stored,
            high_bit,
            pixel_representation,
            planar_configuration,
        }
        .validate()
    }

    pub fn rows(&self) -> u16 {
        self.rows
    }

    pub fn columns(&self) -> u16 {
        self.columns
    }

    pub fn number_of_frames(&self) -> u32 {
        self.number_of_frames
    }

    pub fn samples_per_pixel(&self) -> u16 {
        self.samples_per_pixel
    }

    pub fn bits_allocated(&self) -> u16 {
        self.bits_allocated
    }

    pub fn bits_stored(&self) -> u16 {
        self.bits_stored
    }

    pub fn high_bit(&self) -> u16 {
        self.high_bit
    }

    pub fn pixel_representation(&self) -> PixelRepresentation {
        self.pixel_representation
    }

    pub fn is_signed(&self) -> bool {
        self.pixel_representation == PixelRepresentation::Signed
    }

    pub fn planar_configuration(&self) -> PlanarConfiguration {
        self.planar_configuration
    }

    /// Number of pixels in one frame.
    pub fn pixels_per_frame(&self) -> u32 {
        u32::from(self.rows) * u32::from(self.columns)
    }

    /// Number of samples in one frame, across all planes.
    pub fn samples_per_frame(&self) -> u64 {
        u64::from(self.pixels_per_frame()) * u64::from(self.samples_per_pixel)
    }

    /// Number of samples in the whole pixel data.
    pub fn total_samples(&self) -> u64 {
        self.samples_per_frame() * u64::from(self.number_of_frames)
    }

    /// The length in bytes of the encoded pixel data,
    /// rounded up to a whole number of 16-bit words.
    pub fn expected_length(&self) -> u64 {
        let bits = self.total_samples() * u64::from(self.bits_allocated);
        (bits + 15) / 16 * 2
    }

    /// Reject a pixel data length inconsistent with this layout.
    ///
    /// A length of exactly the sample bytes, without the trailing padding,
    /// is also accepted.
    pub fn check_length(&self, length: u64) -> Result<()> {
        let expected = self.expected_length();
        let unpadded = (self.total_samples() * u64::from(self.bits_allocated) + 7) / 8;
        ensure!(
            length == expected || length == unpadded,
            LengthMismatchSnafu {
                expected,
                actual: length,
            }
        );
        Ok(())
    }

    /// Position in stream order of the given sample,
    /// honoring the planar configuration.
    pub(crate) fn stream_index(&self, frame: u32, plane: u16, pixel: u32) -> u64 {
        let frame_start = u64::from(frame) * self.samples_per_frame();
        let within = match self.planar_configuration {
            PlanarConfiguration::Interleaved => {
                u64::from(pixel) * u64::from(self.samples_per_pixel) + u64::from(plane)
            }
            PlanarConfiguration::Planar => {
                u64::from(plane) * u64::from(self.pixels_per_frame()) + u64::from(pixel)
            }
        };
        frame_start + within
    }

    /// The (frame, plane, pixel) coordinates of the sample
    /// at the given position in stream order.
    pub(crate) fn coordinates(&self, stream_index: u64) -> (u32, u16, u32) {
        let per_frame = self.samples_per_frame();
        let frame = (stream_index / per_frame) as u32;
        let within = stream_index % per_frame;
        match self.planar_configuration {
            PlanarConfiguration::Interleaved => {
                let spp = u64::from(self.samples_per_pixel);
                (frame, (within % spp) as u16, (within / spp) as u32)
            }
            PlanarConfiguration::Planar => {
                let ppf = u64::from(self.pixels_per_frame());
                (frame, (within / ppf) as u16, (within % ppf) as u32)
            }
        }
    }
}

fn required_u16(obj: &InMemDicomObject, tag: Tag, name: &'static str) -> Result<u16> {
    optional_u16(obj, tag, name)?.context(MissingAttributeSnafu { name })
}

fn optional_u16(obj: &InMemDicomObject, tag: Tag, name: &'static str) -> Result<Option<u16>> {
    obj.get(tag)
        .map(|elem| elem.to_int::<u16>().context(ConvertAttributeSnafu { name }))
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use dicom_core::value::PrimitiveValue;
    use dicom_core::{DataElement, VR};
    use rstest::rstest;

    #[rstest]
    #[case(PixelLayout::new(4, 4, 0), "InvalidBitsAllocated")]
    #[case(PixelLayout::new(4, 4, 17), "InvalidBitsAllocated")]
    #[case(PixelLayout::new(4, 4, 8).with_bits_stored(9, 8), "InvalidBitsStored")]
    #[case(PixelLayout::new(4, 4, 16).with_bits_stored(12, 16), "InvalidHighBit")]
    #[case(PixelLayout::new(4, 4, 16).with_bits_stored(12, 10), "InvalidHighBit")]
    #[case(PixelLayout::new(0, 4, 8), "EmptyDimensions")]
    fn invalid_layouts_are_rejected(#[case] layout: PixelLayout, #[case] expected: &str) {
        let err = layout.validate().unwrap_err();
        assert!(
            format!("{:?}", err).starts_with(expected),
            "unexpected error {:?}",
            err
        );
    }

    #[test]
    fn expected_length_rounds_up_to_words() {
        // 3 x 3 x 12 bits = 108 bits -> 7 words
        let layout = PixelLayout::new(3, 3, 12).validate().unwrap();
        assert_eq!(layout.expected_length(), 14);
        assert!(layout.check_length(14).is_ok());
        assert!(layout.check_length(12).is_err());

        // 3 x 3 x 8 bits = 9 bytes, padded to 10
        let layout = PixelLayout::new(3, 3, 8).with_frames(2).validate().unwrap();
        assert_eq!(layout.expected_length(), 18);
        assert!(layout.check_length(18).is_ok());

        let layout = PixelLayout::new(3, 3, 8).validate().unwrap();
        assert!(layout.check_length(9).is_ok());
        assert!(layout.check_length(10).is_ok());
        assert!(matches!(
            layout.check_length(8),
            Err(LayoutError::LengthMismatch {
                expected: 10,
                actual: 8,
                ..
            })
        ));
    }

    #[rstest]
    #[case(PlanarConfiguration::Interleaved)]
    #[case(PlanarConfiguration::Planar)]
    fn stream_index_and_coordinates_agree(#[case] planar: PlanarConfiguration) {
        let layout = PixelLayout::new(2, 3, 8)
            .with_samples_per_pixel(3)
            .with_frames(2)
            .with_planar_configuration(planar)
            .validate()
            .unwrap();
        for i in 0..layout.total_samples() {
            let (f, s, p) = layout.coordinates(i);
            assert_eq!(layout.stream_index(f, s, p), i);
        }
        let second_green = layout.stream_index(0, 1, 1);
        match planar {
            PlanarConfiguration::Interleaved => assert_eq!(second_green, 4),
            PlanarConfiguration::Planar => assert_eq!(second_green, 7),
        }
    }

    #[test]
    fn layout_from_image_pixel_module() {
        let obj = InMemDicomObject::from_element_iter(vec![
            DataElement::new(tags::ROWS, VR::US, PrimitiveValue::from(512_u16)),
            DataElement::new(tags::COLUMNS, VR::US, PrimitiveValue::from(256_u16)),
            DataElement::new(tags::BITS_ALLOCATED, VR::US, PrimitiveValue::from(16_u16)),
            DataElement::new(tags::BITS_STORED, VR::US, PrimitiveValue::from(12_u16)),
            DataElement::new(tags::HIGH_BIT, VR::US, PrimitiveValue::from(11_u16)),
            DataElement::new(
                tags::PIXEL_REPRESENTATION,
                VR::US,
                PrimitiveValue::from(1_u16),
            ),
            DataElement::new(tags::NUMBER_OF_FRAMES, VR::IS, PrimitiveValue::from("4")),
        ]);
        let layout = PixelLayout::from_object(&obj).unwrap();
        assert_eq!(layout.rows(), 512);
        assert_eq!(layout.columns(), 256);
        assert_eq!(layout.number_of_frames(), 4);
        assert_eq!(layout.samples_per_pixel(), 1);
        assert_eq!(layout.bits_stored(), 12);
        assert_eq!(layout.high_bit(), 11);
        assert!(layout.is_signed());

        let missing = InMemDicomObject::from_element_iter(vec![DataElement::new(
            tags::ROWS,
            VR::US,
            PrimitiveValue::from(512_u16),
        )]);
        assert!(matches!(
            PixelLayout::from_object(&missing),
            Err(LayoutError::MissingAttribute {
                name: "Columns",
                ..
            })
        ));
    }
}
