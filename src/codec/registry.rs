//! Per-format backend priority lists.

use std::collections::HashMap;
use std::sync::Arc;

use super::external::{AvifEnc, Cwebp, HeifConvert, HeifEnc, Img2Webp, MozJpeg};
use super::ffmpeg::{FfmpegGif, FfmpegTranscoder};
use super::image_codec::{ImageDecoder, ImageGifCodec, ImageJpegEncoder, Rav1eAvifEncoder};
use super::{BackendPreference, CodecBackend};
use crate::format::MediaFormat;

/// Ordered encoder and decoder lists keyed by format.
#[derive(Clone, Default)]
pub struct BackendRegistry {
    encoders: HashMap<MediaFormat, Vec<Arc<dyn CodecBackend>>>,
    decoders: HashMap<MediaFormat, Vec<Arc<dyn CodecBackend>>>,
}

impl BackendRegistry {
    pub fn empty() -> Self {
        Self::default()
    }

    /// The built-in backends in their default priority order.
    pub fn with_defaults() -> Self {
        let image_decoder: Arc<dyn CodecBackend> = Arc::new(ImageDecoder);
        let ffmpeg: Arc<dyn CodecBackend> = Arc::new(FfmpegTranscoder);

        Self::empty()
            .with_encoder(MediaFormat::Jpeg, Arc::new(MozJpeg))
            .with_encoder(MediaFormat::Jpeg, Arc::new(ImageJpegEncoder))
            .with_encoder(MediaFormat::WebP, Arc::new(Cwebp))
            .with_encoder(MediaFormat::WebP, Arc::new(Img2Webp))
            .with_encoder(MediaFormat::Avif, Arc::new(AvifEnc))
            .with_encoder(MediaFormat::Avif, Arc::new(Rav1eAvifEncoder))
            .with_encoder(MediaFormat::Gif, Arc::new(FfmpegGif))
            .with_encoder(MediaFormat::Gif, Arc::new(ImageGifCodec))
            .with_encoder(MediaFormat::Heic, Arc::new(HeifEnc))
            .with_decoder(MediaFormat::Jpeg, Arc::clone(&image_decoder))
            .with_decoder(MediaFormat::Png, Arc::clone(&image_decoder))
            .with_decoder(MediaFormat::Gif, Arc::clone(&image_decoder))
            .with_decoder(MediaFormat::WebP, image_decoder)
            .with_decoder(MediaFormat::Avif, Arc::clone(&ffmpeg))
            .with_decoder(MediaFormat::Heic, Arc::new(HeifConvert))
            .with_decoder(MediaFormat::Heic, ffmpeg)
    }

    /// Appends an encoder at the lowest priority for `format`.
    pub fn with_encoder(mut self, format: MediaFormat, backend: Arc<dyn CodecBackend>) -> Self {
        self.encoders.entry(format).or_default().push(backend);
        self
    }

    /// Appends a decoder at the lowest priority for `format`.
    pub fn with_decoder(mut self, format: MediaFormat, backend: Arc<dyn CodecBackend>) -> Self {
        self.decoders.entry(format).or_default().push(backend);
        self
    }

    /// Encoders for `format`, backends of the preferred kind first. Order is otherwise stable.
    pub fn encoders(&self, format: MediaFormat, preference: BackendPreference) -> Vec<Arc<dyn CodecBackend>> {
        let preferred = preference.preferred_kind();
        let all = self.encoders.get(&format).cloned().unwrap_or_default();
        let (mut first, rest): (Vec<_>, Vec<_>) = all.into_iter().partition(|b| b.kind() == preferred);
        first.extend(rest);
        first
    }

    pub fn decoders(&self, format: MediaFormat) -> Vec<Arc<dyn CodecBackend>> {
        self.decoders.get(&format).cloned().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::BackendId;

    fn ids(backends: &[Arc<dyn CodecBackend>]) -> Vec<BackendId> {
        backends.iter().map(|b| b.id()).collect()
    }

    #[test]
    fn test_avif_order_follows_preference() {
        let registry = BackendRegistry::with_defaults();
        assert_eq!(
            ids(&registry.encoders(MediaFormat::Avif, BackendPreference::System)),
            vec![BackendId::AvifEnc, BackendId::Rav1e]
        );
        assert_eq!(
            ids(&registry.encoders(MediaFormat::Avif, BackendPreference::Native)),
            vec![BackendId::Rav1e, BackendId::AvifEnc]
        );
    }

    #[test]
    fn test_preference_keeps_relative_order_of_other_kinds() {
        let registry = BackendRegistry::with_defaults();
        // ffmpeg is neither system nor native and stays ahead of the other non-preferred backend
        assert_eq!(
            ids(&registry.encoders(MediaFormat::Gif, BackendPreference::System)),
            vec![BackendId::FfmpegGif, BackendId::ImageGif]
        );
        assert_eq!(
            ids(&registry.encoders(MediaFormat::Gif, BackendPreference::Native)),
            vec![BackendId::ImageGif, BackendId::FfmpegGif]
        );
    }

    #[test]
    fn test_png_has_no_generic_encoder() {
        let registry = BackendRegistry::with_defaults();
        assert!(registry.encoders(MediaFormat::Png, BackendPreference::System).is_empty());
        assert_eq!(ids(&registry.decoders(MediaFormat::Png)), vec![BackendId::ImageDecoder]);
        assert_eq!(
            ids(&registry.decoders(MediaFormat::Heic)),
            vec![BackendId::HeifConvert, BackendId::Ffmpeg]
        );
    }
}
