//! HTML pages served by the monitor web UI.
//!
//! The static index is kept as a `&'static str` so it ships inside the
//! binary; the clip pages are rendered from the clip listing per request.

use std::fmt::Write;

use motion_core::ClipEntry;

const STYLE: &str = r#"
  <style>
    body { margin: 0; background: #0b1120; color: #e2e8f0; font-family: ui-sans-serif, system-ui, sans-serif; }
    header { padding: 12px 20px; background: #111a2e; display: flex; gap: 20px; align-items: baseline; }
    header h1 { margin: 0; font-size: 1.2rem; }
    a { color: #38bdf8; text-decoration: none; }
    main { padding: 20px; }
    img.feed { max-width: 100%; border: 1px solid #1e293b; }
    ul.clips { list-style: none; padding: 0; }
    ul.clips li { padding: 6px 0; border-bottom: 1px solid #1e293b; }
    #status { font-family: ui-monospace, monospace; font-size: 0.85rem; color: #94a3b8; }
  </style>"#;

pub const INDEX_HTML: &str = r#"<!doctype html>
<html lang="en">
<head>
  <meta charset="UTF-8" />
  <meta name="viewport" content="width=device-width, initial-scale=1.0" />
  <title>Motion Camera</title>
  <style>
    body { margin: 0; background: #0b1120; color: #e2e8f0; font-family: ui-sans-serif, system-ui, sans-serif; }
    header { padding: 12px 20px; background: #111a2e; display: flex; gap: 20px; align-items: baseline; }
    header h1 { margin: 0; font-size: 1.2rem; }
    a { color: #38bdf8; text-decoration: none; }
    main { padding: 20px; }
    img.feed { max-width: 100%; border: 1px solid #1e293b; }
    #status { font-family: ui-monospace, monospace; font-size: 0.85rem; color: #94a3b8; }
  </style>
</head>
<body>
  <header>
    <h1>Motion Camera</h1>
    <a href="/video_list">Recorded clips</a>
  </header>
  <main>
    <img class="feed" src="/video_feed" alt="live feed" />
    <p id="status">waiting for status&hellip;</p>
  </main>
  <script>
    async function refresh() {
      try {
        const res = await fetch("/status");
        const s = await res.json();
        const rec = s.recording ? "REC " + (s.current_clip ?? "") : "idle";
        document.getElementById("status").textContent =
          `${rec} | frames ${s.frames_processed} | ${s.fps.toFixed(1)} fps | clips ${s.clips_recorded}` +
          (s.warm ? "" : " | warming up");
      } catch (_) {}
    }
    refresh();
    setInterval(refresh, 1000);
  </script>
</body>
</html>
"#;

fn page(title: &str, body: &str) -> String {
    format!(
        "<!doctype html>\n<html lang=\"en\">\n<head>\n  <meta charset=\"UTF-8\" />\n  \
         <title>{title}</title>{STYLE}\n</head>\n<body>\n  <header>\n    <h1>{title}</h1>\n    \
         <a href=\"/\">Live</a>\n    <a href=\"/video_list\">Recorded clips</a>\n  </header>\n  \
         <main>\n{body}  </main>\n</body>\n</html>\n"
    )
}

/// Clip index, newest first as given.
pub fn clip_list_page(clips: &[ClipEntry]) -> String {
    let mut body = String::new();
    if clips.is_empty() {
        body.push_str("    <p>No clips recorded yet.</p>\n");
    } else {
        body.push_str("    <ul class=\"clips\">\n");
        for clip in clips {
            let _ = writeln!(
                body,
                "      <li><a href=\"/video/{}\">{}</a></li>",
                clip.stem, clip.display
            );
        }
        body.push_str("    </ul>\n");
    }
    page("Recorded clips", &body)
}

/// Player page streaming one clip.
pub fn clip_player_page(clip: &ClipEntry) -> String {
    let body = format!(
        "    <h2>{}</h2>\n    <img class=\"feed\" src=\"/clips/{}/stream.mjpg\" alt=\"clip playback\" />\n",
        clip.display, clip.stem
    );
    page(&clip.display, &body)
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;

    fn entry(stem: &str, display: &str) -> ClipEntry {
        ClipEntry {
            stem: stem.into(),
            display: display.into(),
            path: PathBuf::from(format!("output/{stem}.clip")),
        }
    }

    #[test]
    fn list_links_each_clip_in_order() {
        let html = clip_list_page(&[
            entry("20240301-120000", "01.03.2024 - 12:00:00"),
            entry("20240201-090909", "01.02.2024 - 09:09:09"),
        ]);
        let first = html.find("/video/20240301-120000").unwrap();
        let second = html.find("/video/20240201-090909").unwrap();
        assert!(first < second);
        assert!(html.contains(">01.03.2024 - 12:00:00</a>"));
    }

    #[test]
    fn empty_list_says_so() {
        assert!(clip_list_page(&[]).contains("No clips recorded yet."));
    }

    #[test]
    fn player_embeds_playback_stream() {
        let html = clip_player_page(&entry("20240301-120000", "01.03.2024 - 12:00:00"));
        assert!(html.contains("src=\"/clips/20240301-120000/stream.mjpg\""));
        assert!(html.contains("<title>01.03.2024 - 12:00:00</title>"));
    }
}
