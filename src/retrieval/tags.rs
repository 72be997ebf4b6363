use anyhow::{Context, Result};
use id3::frame::{Picture, PictureType};
use id3::{Tag, TagLike, Version};

/// Metadata written around a remuxed MP3.
#[derive(Debug, Clone, Default)]
pub struct TrackTags {
    pub title: String,
    pub artist: String,
    pub album: String,
    pub track_number: Option<u32>,
    pub disc_number: Option<u32>,
    /// Release date as `YYYY-MM-DD`; only the year is written.
    pub release_date: Option<String>,
    pub duration_seconds: Option<u32>,
    pub isrc: Option<String>,
    /// Record label; also fills the ID3v1 comment field.
    pub publisher: Option<String>,
    pub cover_jpeg: Option<Vec<u8>>,
}

impl TrackTags {
    fn year(&self) -> Option<&str> {
        self.release_date
            .as_deref()
            .and_then(|date| date.get(..4))
            .filter(|year| year.bytes().all(|b| b.is_ascii_digit()))
    }
}

/// Serialized ID3v2.3 tag to prepend to the audio stream.
pub fn id3v2(tags: &TrackTags) -> Result<Vec<u8>> {
    let mut tag = Tag::new();
    tag.set_title(&tags.title);
    tag.set_artist(&tags.artist);
    tag.set_album_artist(&tags.artist);
    tag.set_album(&tags.album);
    if let Some(track) = tags.track_number {
        tag.set_track(track);
    }
    if let Some(disc) = tags.disc_number {
        tag.set_disc(disc);
    }
    if let Some(year) = tags.year().and_then(|y| y.parse().ok()) {
        tag.set_year(year);
    }
    if let Some(duration) = tags.duration_seconds {
        tag.set_duration(duration * 1000);
    }
    if let Some(ref isrc) = tags.isrc {
        tag.set_text("TSRC", isrc);
    }
    if let Some(ref publisher) = tags.publisher {
        tag.set_text("TPUB", publisher);
    }
    tag.set_text("TFLT", "MPG/3");
    if let Some(ref cover) = tags.cover_jpeg {
        tag.add_frame(Picture {
            mime_type: "image/jpeg".to_string(),
            picture_type: PictureType::CoverFront,
            description: String::new(),
            data: cover.clone(),
        });
    }

    let mut out = Vec::new();
    tag.write_to(&mut out, Version::Id3v23)
        .context("Failed to write ID3v2 tag")?;
    Ok(out)
}

pub const ID3V1_LEN: usize = 128;

/// Fixed-width ID3v1.1 trailer. Text fields are truncated to their width and
/// zero padded; genre is left undefined (255).
pub fn id3v1_1(tags: &TrackTags) -> [u8; ID3V1_LEN] {
    let mut out = [0u8; ID3V1_LEN];
    out[..3].copy_from_slice(b"TAG");
    write_field(&mut out[3..33], &tags.title);
    write_field(&mut out[33..63], &tags.artist);
    write_field(&mut out[63..93], &tags.album);
    write_field(&mut out[93..97], tags.year().unwrap_or_default());
    write_field(&mut out[97..125], tags.publisher.as_deref().unwrap_or_default());
    // out[125] stays zero: marks the v1.1 track byte as present
    out[126] = tags
        .track_number
        .and_then(|n| u8::try_from(n).ok())
        .unwrap_or(0);
    out[127] = 255;
    out
}

fn write_field(field: &mut [u8], value: &str) {
    let bytes = value.as_bytes();
    let len = bytes.len().min(field.len());
    field[..len].copy_from_slice(&bytes[..len]);
}
