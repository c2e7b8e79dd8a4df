use std::collections::HashMap;

use lazy_static::lazy_static;
use tracing::{info, warn};
use whatlang::{Detector, Lang};

pub const DEFAULT_LANGUAGE: &str = "en";

/// Static mapping from accepted language codes to the codes a model understands.
pub struct LanguageTable {
    entries: &'static [(&'static str, &'static str)],
    index: HashMap<&'static str, &'static str>,
}

impl LanguageTable {
    fn new(entries: &'static [(&'static str, &'static str)]) -> Self {
        Self {
            entries,
            index: entries.iter().copied().collect(),
        }
    }

    /// Canonical code for `code`, `en` when the code is not in the table.
    pub fn resolve(&self, code: &str) -> &'static str {
        self.lookup(code).unwrap_or(DEFAULT_LANGUAGE)
    }

    pub fn lookup(&self, code: &str) -> Option<&'static str> {
        self.index
            .get(code.trim().to_lowercase().as_str())
            .copied()
    }

    pub fn is_canonical(&self, code: &str) -> bool {
        self.entries.iter().any(|(_, canonical)| *canonical == code)
    }

    /// Accepted input codes in table order.
    pub fn codes(&self) -> Vec<&'static str> {
        self.entries.iter().map(|(code, _)| *code).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

lazy_static! {
    pub static ref TRANSLATION_LANGUAGES: LanguageTable = LanguageTable::new(&[
        ("en", "en"),
        ("es", "es"),
        ("fr", "fr"),
        ("de", "de"),
        ("it", "it"),
        ("pt", "pt"),
        ("pt-br", "pt"),
        ("pt-pt", "pt"),
        ("ru", "ru"),
        ("zh", "zh"),
        ("zh-cn", "zh"),
        ("zh-tw", "zh"),
        ("ja", "ja"),
        ("ko", "ko"),
        ("ar", "ar"),
        ("hi", "hi"),
        ("tr", "tr"),
        ("nl", "nl"),
        ("pl", "pl"),
        ("sv", "sv"),
        ("da", "da"),
        ("no", "no"),
        ("fi", "fi"),
        ("cs", "cs"),
        ("hu", "hu"),
        ("ro", "ro"),
        ("bg", "bg"),
        ("hr", "hr"),
        ("sk", "sk"),
        ("sl", "sl"),
        ("et", "et"),
        ("lv", "lv"),
        ("lt", "lt"),
        ("mt", "mt"),
        ("ga", "ga"),
        ("cy", "cy"),
        ("eu", "eu"),
        ("ca", "ca"),
        ("gl", "gl"),
        ("is", "is"),
        ("mk", "mk"),
        ("sq", "sq"),
        ("sr", "sr"),
        ("bs", "bs"),
        ("me", "me"),
        ("lb", "lb"),
    ]);

    // XTTS v2 language set
    pub static ref SYNTHESIS_LANGUAGES: LanguageTable = LanguageTable::new(&[
        ("en", "en"),
        ("es", "es"),
        ("fr", "fr"),
        ("de", "de"),
        ("it", "it"),
        ("pt", "pt"),
        ("pl", "pl"),
        ("tr", "tr"),
        ("ru", "ru"),
        ("nl", "nl"),
        ("cs", "cs"),
        ("ar", "ar"),
        ("zh-cn", "zh-cn"),
        ("ja", "ja"),
        ("hu", "hu"),
        ("ko", "ko"),
    ]);

    // Only languages the translation table can express are candidates
    static ref DETECTOR: Detector = Detector::with_allowlist(
        Lang::all()
            .iter()
            .copied()
            .filter(|lang| {
                iso_639_1(lang.code()).is_some_and(|code| TRANSLATION_LANGUAGES.is_canonical(code))
            })
            .collect()
    );
}

/// Whisper language tokens as `(code, name)`, in token order.
pub const WHISPER_LANGUAGES: [(&str, &str); 99] = [
    ("en", "english"),
    ("zh", "chinese"),
    ("de", "german"),
    ("es", "spanish"),
    ("ru", "russian"),
    ("ko", "korean"),
    ("fr", "french"),
    ("ja", "japanese"),
    ("pt", "portuguese"),
    ("tr", "turkish"),
    ("pl", "polish"),
    ("ca", "catalan"),
    ("nl", "dutch"),
    ("ar", "arabic"),
    ("sv", "swedish"),
    ("it", "italian"),
    ("id", "indonesian"),
    ("hi", "hindi"),
    ("fi", "finnish"),
    ("vi", "vietnamese"),
    ("he", "hebrew"),
    ("uk", "ukrainian"),
    ("el", "greek"),
    ("ms", "malay"),
    ("cs", "czech"),
    ("ro", "romanian"),
    ("da", "danish"),
    ("hu", "hungarian"),
    ("ta", "tamil"),
    ("no", "norwegian"),
    ("th", "thai"),
    ("ur", "urdu"),
    ("hr", "croatian"),
    ("bg", "bulgarian"),
    ("lt", "lithuanian"),
    ("la", "latin"),
    ("mi", "maori"),
    ("ml", "malayalam"),
    ("cy", "welsh"),
    ("sk", "slovak"),
    ("te", "telugu"),
    ("fa", "persian"),
    ("lv", "latvian"),
    ("bn", "bengali"),
    ("sr", "serbian"),
    ("az", "azerbaijani"),
    ("sl", "slovenian"),
    ("kn", "kannada"),
    ("et", "estonian"),
    ("mk", "macedonian"),
    ("br", "breton"),
    ("eu", "basque"),
    ("is", "icelandic"),
    ("hy", "armenian"),
    ("ne", "nepali"),
    ("mn", "mongolian"),
    ("bs", "bosnian"),
    ("kk", "kazakh"),
    ("sq", "albanian"),
    ("sw", "swahili"),
    ("gl", "galician"),
    ("mr", "marathi"),
    ("pa", "punjabi"),
    ("si", "sinhala"),
    ("km", "khmer"),
    ("sn", "shona"),
    ("yo", "yoruba"),
    ("so", "somali"),
    ("af", "afrikaans"),
    ("oc", "occitan"),
    ("ka", "georgian"),
    ("be", "belarusian"),
    ("tg", "tajik"),
    ("sd", "sindhi"),
    ("gu", "gujarati"),
    ("am", "amharic"),
    ("yi", "yiddish"),
    ("lo", "lao"),
    ("uz", "uzbek"),
    ("fo", "faroese"),
    ("ht", "haitian creole"),
    ("ps", "pashto"),
    ("tk", "turkmen"),
    ("nn", "nynorsk"),
    ("mt", "maltese"),
    ("sa", "sanskrit"),
    ("lb", "luxembourgish"),
    ("my", "myanmar"),
    ("bo", "tibetan"),
    ("tl", "tagalog"),
    ("mg", "malagasy"),
    ("as", "assamese"),
    ("tt", "tatar"),
    ("haw", "hawaiian"),
    ("ln", "lingala"),
    ("ha", "hausa"),
    ("ba", "bashkir"),
    ("jw", "javanese"),
    ("su", "sundanese"),
];

/// Whisper code for a language hint given either as a code (`de`) or a name (`german`).
pub fn whisper_language_code(hint: &str) -> Option<&'static str> {
    let hint = hint.trim().to_lowercase();
    WHISPER_LANGUAGES
        .iter()
        .find(|(code, name)| *code == hint || *name == hint)
        .map(|(code, _)| *code)
}

/// Best guess for the language of `text`, expressed in the translation table's codes.
#[tracing::instrument(level = "info", skip(text))]
pub fn detect_language(text: &str) -> &'static str {
    let preview: String = text.chars().take(50).collect();
    info!("Detecting language for text: '{preview}'");

    let Some(info) = DETECTOR.detect(text) else {
        warn!("Language detection failed, defaulting to {DEFAULT_LANGUAGE}");
        return DEFAULT_LANGUAGE;
    };
    if !info.is_reliable() {
        warn!(
            "Unreliable guess {} ({:.3}), defaulting to {DEFAULT_LANGUAGE}",
            info.lang().code(),
            info.confidence()
        );
        return DEFAULT_LANGUAGE;
    }
    let Some(detected) = iso_639_1(info.lang().code()) else {
        warn!("Language {} not supported, defaulting to {DEFAULT_LANGUAGE}", info.lang().code());
        return DEFAULT_LANGUAGE;
    };

    if let Some(mapped) = TRANSLATION_LANGUAGES.lookup(detected) {
        info!("Mapped {detected} to {mapped}");
        return mapped;
    }
    if TRANSLATION_LANGUAGES.is_canonical(detected) {
        return detected;
    }
    warn!("Language {detected} not supported, defaulting to {DEFAULT_LANGUAGE}");
    DEFAULT_LANGUAGE
}

fn iso_639_1(code: &str) -> Option<&'static str> {
    let code = match code {
        "eng" => "en",
        "spa" => "es",
        "fra" => "fr",
        "deu" => "de",
        "ita" => "it",
        "por" => "pt",
        "rus" => "ru",
        "cmn" => "zh",
        "jpn" => "ja",
        "kor" => "ko",
        "arb" | "ara" => "ar",
        "hin" => "hi",
        "tur" => "tr",
        "nld" => "nl",
        "pol" => "pl",
        "swe" => "sv",
        "dan" => "da",
        "nob" | "nno" => "no",
        "fin" => "fi",
        "ces" => "cs",
        "hun" => "hu",
        "ron" => "ro",
        "bul" => "bg",
        "hrv" => "hr",
        "slk" => "sk",
        "slv" => "sl",
        "est" => "et",
        "lav" => "lv",
        "lit" => "lt",
        "cat" => "ca",
        "srp" => "sr",
        "mkd" => "mk",
        "ukr" => "uk",
        "bel" => "be",
        "ell" => "el",
        "heb" => "he",
        "pes" => "fa",
        "urd" => "ur",
        "ben" => "bn",
        "tha" => "th",
        "vie" => "vi",
        "ind" => "id",
        "tgl" => "tl",
        "afr" => "af",
        "aze" => "az",
        "kat" => "ka",
        "hye" => "hy",
        "epo" => "eo",
        "lat" => "la",
        "zul" => "zu",
        "yid" => "yi",
        "tam" => "ta",
        "tel" => "te",
        "mal" => "ml",
        "kan" => "kn",
        "mar" => "mr",
        "guj" => "gu",
        "pan" => "pa",
        "nep" => "ne",
        "sin" => "si",
        "khm" => "km",
        "mya" => "my",
        "amh" => "am",
        "ori" => "or",
        "jav" => "jv",
        "uzb" => "uz",
        "tuk" => "tk",
        "sna" => "sn",
        "aka" => "ak",
        _ => return None,
    };
    Some(code)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn regional_variants_collapse_to_canonical_codes() {
        assert_eq!(TRANSLATION_LANGUAGES.resolve("pt-br"), "pt");
        assert_eq!(TRANSLATION_LANGUAGES.resolve("zh-TW"), "zh");
        assert_eq!(SYNTHESIS_LANGUAGES.resolve("zh-cn"), "zh-cn");
    }

    #[test]
    fn unknown_codes_resolve_to_english_every_time() {
        for _ in 0..3 {
            assert_eq!(TRANSLATION_LANGUAGES.resolve("xx-klingon"), "en");
            assert_eq!(SYNTHESIS_LANGUAGES.resolve("sv"), "en");
        }
    }

    #[test]
    fn codes_keep_table_order() {
        let codes = TRANSLATION_LANGUAGES.codes();
        assert_eq!(codes.len(), TRANSLATION_LANGUAGES.len());
        assert!(!TRANSLATION_LANGUAGES.is_empty());
        assert_eq!(&codes[..3], &["en", "es", "fr"]);
        assert!(codes.contains(&"pt-br"));
    }

    #[test]
    fn whisper_hints_accept_codes_and_names() {
        assert_eq!(whisper_language_code("de"), Some("de"));
        assert_eq!(whisper_language_code("German"), Some("de"));
        assert_eq!(whisper_language_code("klingon"), None);
    }

    #[test]
    fn detects_english_sentence() {
        let text = "The quick brown fox jumps over the lazy dog while the children watch from the window.";
        assert_eq!(detect_language(text), "en");
    }

    #[test]
    fn detects_spanish_sentence() {
        let text = "El perro corre rápidamente por el parque mientras los niños juegan con la pelota \
                    y sus padres conversan tranquilamente en los bancos bajo la sombra de los árboles.";
        assert_eq!(detect_language(text), "es");
    }

    #[test]
    fn short_greetings_fall_back_to_english() {
        assert_eq!(detect_language("Hello"), "en");
    }

    #[test]
    fn detection_only_yields_table_languages() {
        let text = "Jen la trinkejo fermitis, ni iras tra mallumo kaj pluvo sub la grandaj arboj de la urbo.";
        let detected = detect_language(text);
        assert!(TRANSLATION_LANGUAGES.is_canonical(detected));
    }

    #[test]
    fn undetectable_text_defaults_to_english() {
        assert_eq!(detect_language("1234 5678"), "en");
    }
}
