use std::str::FromStr;

/// The closed set of traffic categories tracked by the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Video,
    Social,
    Messaging,
    Gaming,
    Search,
    System,
    General,
}

impl Category {
    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Video => "video",
            Category::Social => "social",
            Category::Messaging => "messaging",
            Category::Gaming => "gaming",
            Category::Search => "search",
            Category::System => "system",
            Category::General => "general",
        }
    }
}

impl FromStr for Category {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "video" => Ok(Category::Video),
            "social" => Ok(Category::Social),
            "messaging" => Ok(Category::Messaging),
            "gaming" => Ok(Category::Gaming),
            "search" => Ok(Category::Search),
            "system" => Ok(Category::System),
            "general" => Ok(Category::General),
            _ => Err(()),
        }
    }
}

impl std::fmt::Display for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// Ordered keyword table. Earlier entries win, so more specific substrings
// (googlevideo, play.googleapis) must appear before the broader ones
// (google.) that would otherwise shadow them.
const CATEGORY_KEYWORDS: &[(&str, Category)] = &[
    ("googlevideo", Category::Video),
    ("youtube", Category::Video),
    ("ytimg", Category::Video),
    ("netflix", Category::Video),
    ("vimeo", Category::Video),
    ("hotstar", Category::Video),
    ("primevideo", Category::Video),
    ("twitch", Category::Gaming),
    ("steampowered", Category::Gaming),
    ("steamcontent", Category::Gaming),
    ("roblox", Category::Gaming),
    ("epicgames", Category::Gaming),
    ("playvalorant", Category::Gaming),
    ("riotgames", Category::Gaming),
    ("minecraft", Category::Gaming),
    ("battle.net", Category::Gaming),
    ("ea.com", Category::Gaming),
    ("slowroads", Category::Gaming),
    ("facebook", Category::Social),
    ("fbcdn", Category::Social),
    ("instagram", Category::Social),
    ("cdninstagram", Category::Social),
    ("tiktok", Category::Social),
    ("snapchat", Category::Social),
    ("twitter", Category::Social),
    ("reddit", Category::Social),
    ("pinterest", Category::Social),
    ("whatsapp", Category::Messaging),
    ("telegram", Category::Messaging),
    ("discord", Category::Messaging),
    ("signal.org", Category::Messaging),
    ("msftconnecttest", Category::System),
    ("pubsub.googleapis", Category::System),
    ("play.googleapis", Category::System),
    ("android.clients.google", Category::System),
    ("gstatic", Category::System),
    ("windowsupdate", Category::System),
    ("google.", Category::Search),
    ("bing.com", Category::Search),
    ("duckduckgo", Category::Search),
];

// Display labels for the admin surface. Substring table with the same
// first-match contract as the category table.
const APP_KEYWORDS: &[(&str, &str)] = &[
    ("googlevideo", "YouTube Streaming"),
    ("youtube", "YouTube"),
    ("ytimg", "YouTube"),
    ("netflix", "Netflix"),
    ("twitch", "Twitch"),
    ("steam", "Steam"),
    ("roblox", "Roblox"),
    ("epicgames", "Epic Games"),
    ("playvalorant", "Valorant"),
    ("riotgames", "Riot Games"),
    ("minecraft", "Minecraft"),
    ("whatsapp", "WhatsApp"),
    ("telegram", "Telegram"),
    ("discord", "Discord"),
    ("cdninstagram", "Instagram"),
    ("instagram", "Instagram"),
    ("fbcdn", "Facebook/Instagram CDN"),
    ("facebook", "Facebook"),
    ("tiktok", "TikTok"),
    ("snapchat", "Snapchat"),
    ("twitter", "Twitter"),
    ("reddit", "Reddit"),
    ("msftconnecttest", "Microsoft Connectivity Test"),
    ("play.googleapis", "Google Play Store"),
    ("android.clients.google", "Google Android Services"),
    ("googleapis", "Google Services"),
    ("google.", "Google Search"),
    ("bing.com", "Bing"),
    ("duckduckgo", "DuckDuckGo"),
];

/// Classify a hostname into a category and a display app name.
///
/// Pure and re-entrant: lowercases the input, scans the ordered keyword
/// tables, and returns the first match. Unmatched hostnames fall through to
/// `Category::General` / "Unknown". Table ordering is part of the contract.
pub fn classify(hostname: &str) -> (Category, &'static str) {
    let lowered = hostname.to_ascii_lowercase();
    let category = CATEGORY_KEYWORDS
        .iter()
        .find(|(keyword, _)| lowered.contains(keyword))
        .map(|(_, category)| *category)
        .unwrap_or(Category::General);
    let app = APP_KEYWORDS
        .iter()
        .find(|(keyword, _)| lowered.contains(keyword))
        .map(|(_, app)| *app)
        .unwrap_or("Unknown");
    (category, app)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_video_hostnames() {
        assert_eq!(classify("r3---sn-gwpa.googlevideo.com").0, Category::Video);
        assert_eq!(classify("WWW.YOUTUBE.COM").0, Category::Video);
        assert_eq!(classify("i.ytimg.com").0, Category::Video);
    }

    #[test]
    fn test_ordering_specific_before_broad() {
        // googlevideo must win over the trailing "google." search entry.
        let (category, app) = classify("rr4.googlevideo.com");
        assert_eq!(category, Category::Video);
        assert_eq!(app, "YouTube Streaming");
        // Bare google domains still classify as search.
        assert_eq!(classify("www.google.com").0, Category::Search);
    }

    #[test]
    fn test_system_before_search() {
        assert_eq!(classify("play.googleapis.com").0, Category::System);
        assert_eq!(classify("android.clients.google.com").0, Category::System);
    }

    #[test]
    fn test_default_general() {
        let (category, app) = classify("intranet.example.edu");
        assert_eq!(category, Category::General);
        assert_eq!(app, "Unknown");
    }

    #[test]
    fn test_deterministic() {
        for _ in 0..3 {
            assert_eq!(classify("cdn.discordapp.com").0, Category::Messaging);
        }
    }

    #[test]
    fn test_category_round_trip() {
        for category in [
            Category::Video,
            Category::Social,
            Category::Messaging,
            Category::Gaming,
            Category::Search,
            Category::System,
            Category::General,
        ] {
            assert_eq!(category.as_str().parse::<Category>(), Ok(category));
        }
    }
}
