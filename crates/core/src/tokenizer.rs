use std::path::Path;

use tokenizers::Tokenizer;

use crate::error::{Error, Result};

pub const BOS_TOKEN: &str = "<s>";
pub const PAD_TOKEN: &str = "<pad>";
pub const EOS_TOKEN: &str = "</s>";
pub const UNK_TOKEN: &str = "<unk>";

/// Ids of the special tokens the decoder loop depends on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpecialTokenIds {
    pub bos: u32,
    pub pad: u32,
    pub eos: u32,
    pub unk: u32,
}

/// Prompt token ids with their attention mask.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedPrompt {
    pub ids: Vec<u32>,
    pub attention_mask: Vec<u32>,
}

pub struct TokenizerWrapper {
    inner: Tokenizer,
}

impl TokenizerWrapper {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let inner = Tokenizer::from_file(path.as_ref())
            .map_err(|e| Error::Tokenizer(format!("tokenizer load: {e}")))?;
        Ok(Self { inner })
    }

    /// Word-level tokenizer with BART-style specials at ids 0..4
    /// (`<s>`, `<pad>`, `</s>`, `<unk>`) followed by `t4`, `t5`, ...
    /// Encoding with special tokens wraps the text as `<s> ... </s>`.
    #[cfg(any(test, feature = "test-utils"))]
    pub fn for_testing(vocab_size: usize) -> Self {
        use tokenizers::models::wordlevel::WordLevel;
        use tokenizers::pre_tokenizers::whitespace::Whitespace;
        use tokenizers::processors::template::TemplateProcessing;
        use tokenizers::AddedToken;

        let specials = [BOS_TOKEN, PAD_TOKEN, EOS_TOKEN, UNK_TOKEN];
        let mut vocab = ahash::AHashMap::new();
        for (i, token) in specials.iter().enumerate() {
            vocab.insert(token.to_string(), i as u32);
        }
        for i in specials.len()..vocab_size {
            vocab.insert(format!("t{i}"), i as u32);
        }
        let model = WordLevel::builder()
            .vocab(vocab)
            .unk_token(UNK_TOKEN.into())
            .build()
            .expect("build test tokenizer model");
        let post_processor = TemplateProcessing::builder()
            .try_single(format!("{BOS_TOKEN} $A {EOS_TOKEN}"))
            .expect("template")
            .special_tokens(vec![(BOS_TOKEN, 0), (EOS_TOKEN, 2)])
            .build()
            .expect("build post processor");

        let mut tokenizer = Tokenizer::new(model);
        tokenizer.with_pre_tokenizer(Some(Whitespace {}));
        tokenizer.with_post_processor(Some(post_processor));
        let added: Vec<AddedToken> = specials
            .iter()
            .map(|t| AddedToken::from(t.to_string(), true))
            .collect();
        tokenizer.add_special_tokens(&added);
        Self { inner: tokenizer }
    }

    /// Encode without special tokens.
    pub fn encode(&self, text: &str) -> Result<Vec<u32>> {
        let encoding = self
            .inner
            .encode(text, false)
            .map_err(|e| Error::Tokenizer(format!("encode: {e}")))?;
        Ok(encoding.get_ids().to_vec())
    }

    /// Encode a prompt for the encoder: special tokens added, with mask.
    pub fn encode_prompt(&self, text: &str) -> Result<EncodedPrompt> {
        let encoding = self
            .inner
            .encode(text, true)
            .map_err(|e| Error::Tokenizer(format!("encode: {e}")))?;
        Ok(EncodedPrompt {
            ids: encoding.get_ids().to_vec(),
            attention_mask: encoding.get_attention_mask().to_vec(),
        })
    }

    /// Decode, dropping special tokens.
    pub fn decode(&self, ids: &[u32]) -> Result<String> {
        self.inner
            .decode(ids, true)
            .map_err(|e| Error::Tokenizer(format!("decode: {e}")))
    }

    pub fn token_id(&self, token: &str) -> Result<u32> {
        self.inner
            .token_to_id(token)
            .ok_or_else(|| Error::Tokenizer(format!("token {token:?} is not in the vocabulary")))
    }

    pub fn special_tokens(&self) -> Result<SpecialTokenIds> {
        Ok(SpecialTokenIds {
            bos: self.token_id(BOS_TOKEN)?,
            pad: self.token_id(PAD_TOKEN)?,
            eos: self.token_id(EOS_TOKEN)?,
            unk: self.token_id(UNK_TOKEN)?,
        })
    }

    pub fn vocab_size(&self) -> usize {
        self.inner.get_vocab_size(true)
    }
}
