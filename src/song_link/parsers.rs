//! Zero-network song link parsers, keyed by URL host.

use url::Url;

use super::CanonicalSongLink;
use crate::identity::is_yandex_music_host;

type Parser = fn(&Url) -> Option<CanonicalSongLink>;

/// SoundCloud API track URIs as handed out by the SoundCloud widget API.
const SOUNDCLOUD_TRACK_URI: &str = "soundcloud:tracks:";

/// Parse `track_url` without touching the network. Returns `None` for hosts
/// without a parser and for URLs the matching parser cannot read.
pub fn parse_structural(track_url: &str) -> Option<CanonicalSongLink> {
    if let Some(id) = track_url.strip_prefix(SOUNDCLOUD_TRACK_URI) {
        return (!id.is_empty()).then(|| CanonicalSongLink::song("sc", id));
    }

    let url = Url::parse(track_url).ok()?;
    let parser = parser_for_host(url.host_str()?)?;
    parser(&url)
}

fn parser_for_host(host: &str) -> Option<Parser> {
    let host = host.strip_prefix("www.").unwrap_or(host);
    if is_yandex_music_host(host) {
        return Some(parse_yandex);
    }
    match host {
        "open.spotify.com" | "play.spotify.com" => Some(parse_spotify),
        "itunes.apple.com" | "music.apple.com" | "geo.music.apple.com" => Some(parse_apple),
        "youtube.com" | "m.youtube.com" | "music.youtube.com" => Some(parse_youtube),
        "youtu.be" => Some(parse_youtu_be),
        "deezer.com" => Some(parse_deezer),
        _ => None,
    }
}

fn last_segment(url: &Url) -> Option<&str> {
    url.path_segments()?.filter(|s| !s.is_empty()).last()
}

fn query_param(url: &Url, name: &str) -> Option<String> {
    url.query_pairs()
        .find(|(key, value)| key == name && !value.is_empty())
        .map(|(_, value)| value.into_owned())
}

fn parse_spotify(url: &Url) -> Option<CanonicalSongLink> {
    last_segment(url).map(|id| CanonicalSongLink::song("s", id))
}

fn parse_yandex(url: &Url) -> Option<CanonicalSongLink> {
    last_segment(url).map(|id| CanonicalSongLink::song("ya", id))
}

fn parse_deezer(url: &Url) -> Option<CanonicalSongLink> {
    last_segment(url).map(|id| CanonicalSongLink::song("d", id))
}

fn parse_youtube(url: &Url) -> Option<CanonicalSongLink> {
    query_param(url, "v").map(|id| CanonicalSongLink::song("y", id))
}

fn parse_youtu_be(url: &Url) -> Option<CanonicalSongLink> {
    last_segment(url).map(|id| CanonicalSongLink::song("y", id))
}

/// `?i=` names a track inside an album page; without it the URL points at the
/// album itself, whose last segment looks like `id1606018075`.
fn parse_apple(url: &Url) -> Option<CanonicalSongLink> {
    if let Some(track_id) = query_param(url, "i") {
        return Some(CanonicalSongLink::song("i", track_id));
    }
    let album = last_segment(url)?;
    let album_id = album.strip_prefix("id").unwrap_or(album);
    Some(CanonicalSongLink::album("i", album_id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::song_link::LinkKind;

    fn suffix(url: &str) -> Option<String> {
        parse_structural(url).map(|link| link.suffix())
    }

    #[test]
    fn test_spotify() {
        assert_eq!(
            suffix("https://open.spotify.com/track/5L1eW2bt7pDbjhNLKWKom2?si=abc"),
            Some("s/5L1eW2bt7pDbjhNLKWKom2".to_string())
        );
        assert_eq!(
            suffix("https://open.spotify.com/intl-de/track/5L1eW2bt7pDbjhNLKWKom2"),
            Some("s/5L1eW2bt7pDbjhNLKWKom2".to_string())
        );
        assert_eq!(
            suffix("https://play.spotify.com/track/abc/"),
            Some("s/abc".to_string())
        );
    }

    #[test]
    fn test_yandex_any_tld() {
        for tld in ["ru", "com", "by", "kz"] {
            let url = format!("https://music.yandex.{}/album/15743698/track/79714180", tld);
            assert_eq!(suffix(&url), Some("ya/79714180".to_string()));
        }
        assert_eq!(
            suffix("https://music.example/track/79714180"),
            Some("ya/79714180".to_string())
        );
    }

    #[test]
    fn test_apple_track_and_album() {
        let track = parse_structural(
            "https://music.apple.com/us/album/song/1606018075?i=1606018081",
        )
        .unwrap();
        assert_eq!(track.kind(), LinkKind::Song);
        assert_eq!(track.url(), "https://song.link/i/1606018081");

        let album = parse_structural("https://itunes.apple.com/us/album/name/id1606018075").unwrap();
        assert_eq!(album.kind(), LinkKind::Album);
        assert_eq!(album.url(), "https://album.link/i/1606018075");
    }

    #[test]
    fn test_youtube() {
        assert_eq!(
            suffix("https://www.youtube.com/watch?v=dQw4w9WgXcQ&t=42"),
            Some("y/dQw4w9WgXcQ".to_string())
        );
        assert_eq!(
            suffix("https://youtu.be/dQw4w9WgXcQ"),
            Some("y/dQw4w9WgXcQ".to_string())
        );
        assert_eq!(suffix("https://www.youtube.com/feed/library"), None);
    }

    #[test]
    fn test_deezer() {
        assert_eq!(
            suffix("https://www.deezer.com/en/track/3135556"),
            Some("d/3135556".to_string())
        );
    }

    #[test]
    fn test_soundcloud_uri() {
        assert_eq!(
            suffix("soundcloud:tracks:1234567"),
            Some("sc/1234567".to_string())
        );
        assert_eq!(suffix("soundcloud:tracks:"), None);
    }

    #[test]
    fn test_unknown_hosts_fall_through() {
        assert_eq!(suffix("https://listen.tidal.com/track/1"), None);
        assert_eq!(suffix("https://www.last.fm/music/A/_/B"), None);
        assert_eq!(suffix("not a url"), None);
    }
}
