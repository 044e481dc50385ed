// M2M100 tokenizer: SentencePiece segmentation plus the fairseq vocabulary
use crate::error::{Result, TranslatorError};
use sentencepiece::SentencePieceProcessor;
use std::collections::HashMap;
use std::path::Path;

const BOS_TOKEN: &str = "<s>";
const PAD_TOKEN: &str = "<pad>";
const EOS_TOKEN: &str = "</s>";
const UNK_TOKEN: &str = "<unk>";
const WORD_BOUNDARY: char = '\u{2581}';

/// Language codes of the m2m100 checkpoints, in fairseq dictionary order.
pub const M2M100_LANGUAGES: [&str; 100] = [
    "af", "am", "ar", "ast", "az", "ba", "be", "bg", "bn", "br", "bs", "ca", "ceb", "cs", "cy",
    "da", "de", "el", "en", "es", "et", "fa", "ff", "fi", "fr", "fy", "ga", "gd", "gl", "gu",
    "ha", "he", "hi", "hr", "ht", "hu", "hy", "id", "ig", "ilo", "is", "it", "ja", "jv", "ka",
    "kk", "km", "kn", "ko", "lb", "lg", "ln", "lo", "lt", "lv", "mg", "mk", "ml", "mn", "mr",
    "ms", "my", "ne", "nl", "no", "ns", "oc", "or", "pa", "pl", "ps", "pt", "ro", "ru", "sd",
    "si", "sk", "sl", "so", "sq", "sr", "ss", "su", "sv", "sw", "ta", "th", "tl", "tn", "tr",
    "uk", "ur", "uz", "vi", "wo", "xh", "yi", "yo", "zh", "zu",
];

fn lang_token(code: &str) -> String {
    format!("__{code}__")
}

/// Piece/id tables. Language tokens live after the regular vocabulary unless
/// `vocab.json` already lists them.
#[derive(Debug, Clone)]
pub struct Vocabulary {
    token_to_id: HashMap<String, u32>,
    id_to_token: HashMap<u32, String>,
    lang_to_id: HashMap<String, u32>,
    id_to_lang: HashMap<u32, String>,
    languages: Vec<String>,
    bos_id: u32,
    pad_id: u32,
    eos_id: u32,
    unk_id: u32,
}

impl Vocabulary {
    pub fn new(token_to_id: HashMap<String, u32>, languages: &[&str]) -> Result<Self> {
        let special = |token: &str| {
            token_to_id.get(token).copied().ok_or_else(|| {
                TranslatorError::Tokenizer(format!("vocabulary has no {token} token"))
            })
        };
        let bos_id = special(BOS_TOKEN)?;
        let pad_id = special(PAD_TOKEN)?;
        let eos_id = special(EOS_TOKEN)?;
        let unk_id = special(UNK_TOKEN)?;

        let encoder_size = token_to_id.len() as u32;
        let mut lang_to_id = HashMap::with_capacity(languages.len());
        for (index, code) in languages.iter().enumerate() {
            let id = token_to_id
                .get(&lang_token(code))
                .copied()
                .unwrap_or(encoder_size + index as u32);
            lang_to_id.insert(code.to_string(), id);
        }
        let id_to_lang = lang_to_id.iter().map(|(k, v)| (*v, k.clone())).collect();
        let id_to_token = token_to_id.iter().map(|(k, v)| (*v, k.clone())).collect();

        Ok(Self {
            token_to_id,
            id_to_token,
            lang_to_id,
            id_to_lang,
            languages: languages.iter().map(|c| c.to_string()).collect(),
            bos_id,
            pad_id,
            eos_id,
            unk_id,
        })
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let token_to_id: HashMap<String, u32> =
            serde_json::from_str(&std::fs::read_to_string(path)?)?;
        Self::new(token_to_id, &M2M100_LANGUAGES)
    }

    pub fn languages(&self) -> &[String] {
        &self.languages
    }

    pub fn lang_id(&self, code: &str) -> Option<u32> {
        self.lang_to_id.get(code).copied()
    }

    pub fn eos_id(&self) -> u32 {
        self.eos_id
    }

    /// `[src_lang] pieces... </s>`
    pub fn encode_pieces<S: AsRef<str>>(&self, pieces: &[S], src_lang: &str) -> Result<Vec<u32>> {
        let lang_id = self
            .lang_id(src_lang)
            .ok_or_else(|| TranslatorError::UnsupportedLanguage(src_lang.to_string()))?;
        let mut ids = Vec::with_capacity(pieces.len() + 2);
        ids.push(lang_id);
        ids.extend(pieces.iter().map(|piece| {
            self.token_to_id
                .get(piece.as_ref())
                .copied()
                .unwrap_or(self.unk_id)
        }));
        ids.push(self.eos_id);
        Ok(ids)
    }

    fn is_special(&self, id: u32) -> bool {
        id == self.bos_id
            || id == self.pad_id
            || id == self.eos_id
            || id == self.unk_id
            || self.id_to_lang.contains_key(&id)
    }

    /// Joins the pieces of `ids`, dropping special and language tokens.
    pub fn decode(&self, ids: &[u32]) -> String {
        let text: String = ids
            .iter()
            .filter(|id| !self.is_special(**id))
            .filter_map(|id| self.id_to_token.get(id))
            .map(String::as_str)
            .collect();
        text.replace(WORD_BOUNDARY, " ").trim().to_string()
    }
}

pub struct M2M100Tokenizer {
    spm: SentencePieceProcessor,
    vocab: Vocabulary,
}

impl M2M100Tokenizer {
    pub fn from_files(spm_path: &Path, vocab_path: &Path) -> Result<Self> {
        let spm = SentencePieceProcessor::open(spm_path)
            .map_err(|e| TranslatorError::Tokenizer(format!("failed to load {spm_path:?}: {e}")))?;
        let vocab = Vocabulary::from_file(vocab_path)?;
        Ok(Self { spm, vocab })
    }

    pub fn vocab(&self) -> &Vocabulary {
        &self.vocab
    }

    /// Encodes `text` as `src_lang`. The language is per call, nothing is stored.
    pub fn encode(&self, text: &str, src_lang: &str) -> Result<Vec<u32>> {
        let pieces = self
            .spm
            .encode(text)
            .map_err(|e| TranslatorError::Tokenizer(e.to_string()))?;
        let pieces: Vec<&str> = pieces.iter().map(|p| p.piece.as_str()).collect();
        self.vocab.encode_pieces(&pieces, src_lang)
    }

    pub fn decode(&self, ids: &[u32]) -> String {
        self.vocab.decode(ids)
    }
}
