/// Upload page served at `/`. Posts the chosen image to `/predict`.
pub const INDEX_HTML: &str = include_str!("../static/index.html");
