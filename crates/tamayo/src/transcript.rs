//! Cumulative worker output with terminal backspace semantics applied.

/// Default retention cap for a transcript, in bytes.
pub const DEFAULT_TRANSCRIPT_LIMIT: usize = 1024 * 1024;

const BACKSPACE: char = '\u{8}';

/// Text record of everything a worker printed during one run.
///
/// Every append collapses `<char><backspace>` pairs, so progress output that
/// rewinds the cursor ends up as the final rendered text. The buffer is kept
/// fully collapsed between appends: at most one unmatched backspace can remain,
/// and only at the very start. That makes a single left-to-right pass over the
/// new chunk equivalent to rescanning the whole buffer, including pairs split
/// across two appends.
#[derive(Debug, Clone, Default)]
pub struct Transcript {
	text: String,
	limit: Option<usize>,
}

impl Transcript {
	/// `limit` caps the retained size in bytes; the oldest text is dropped first.
	pub fn new(limit: Option<usize>) -> Self {
		Self {
			text: String::new(),
			limit: limit.filter(|l| *l > 0),
		}
	}

	pub fn reset(&mut self, banner: &str) {
		self.text.clear();
		self.append(banner);
	}

	pub fn append(&mut self, chunk: &str) {
		for c in chunk.chars() {
			if c == BACKSPACE && self.text.pop().is_some() {
				continue;
			}
			self.text.push(c);
		}
		self.enforce_limit();
	}

	pub fn as_str(&self) -> &str {
		&self.text
	}

	pub fn len(&self) -> usize {
		self.text.len()
	}

	pub fn is_empty(&self) -> bool {
		self.text.is_empty()
	}

	fn enforce_limit(&mut self) {
		let Some(limit) = self.limit else {
			return;
		};
		if self.text.len() <= limit {
			return;
		}
		let mut cut = self.text.len() - limit;
		while !self.text.is_char_boundary(cut) {
			cut += 1;
		}
		self.text.drain(..cut);
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn collapse(chunks: &[&str]) -> String {
		let mut t = Transcript::new(None);
		for chunk in chunks {
			t.append(chunk);
		}
		t.as_str().to_string()
	}

	#[test]
	fn backspace_erases_previous_char() {
		assert_eq!(collapse(&["abc\u{8}d"]), "abd");
	}

	#[test]
	fn backspace_pair_split_across_chunks() {
		let input = "abc\u{8}d";
		let boundaries: Vec<usize> = input.char_indices().map(|(i, _)| i).chain([input.len()]).collect();
		for &i in &boundaries {
			for &j in boundaries.iter().filter(|&&j| j >= i) {
				let got = collapse(&[&input[..i], &input[i..j], &input[j..]]);
				assert_eq!(got, "abd", "split at {} and {}", i, j);
			}
		}
	}

	#[test]
	fn runs_of_backspaces() {
		assert_eq!(collapse(&["abc\u{8}\u{8}def\u{8}ghi"]), "adeghi");
		assert_eq!(collapse(&["50%", "\u{8}\u{8}\u{8}", "75%", "\u{8}\u{8}\u{8}100%"]), "100%");
	}

	#[test]
	fn plain_text_is_concatenated() {
		assert_eq!(collapse(&["hello ", "wörld", "\n", ""]), "hello wörld\n");
	}

	#[test]
	fn unmatched_leading_backspace_is_kept() {
		assert_eq!(collapse(&["\u{8}x"]), "\u{8}x");
		assert_eq!(collapse(&["a\u{8}\u{8}"]), "\u{8}");
		assert_eq!(collapse(&["a\u{8}\u{8}", "\u{8}"]), "");
	}

	#[test]
	fn backspace_reaches_into_earlier_chunks() {
		assert_eq!(collapse(&["Starting ...\n", "\u{8}\u{8}ok"]), "Starting ..ok");
	}

	#[test]
	fn reset_replaces_content() {
		let mut t = Transcript::new(None);
		t.append("old output");
		t.reset("Starting\n");
		assert_eq!(t.as_str(), "Starting\n");
	}

	#[test]
	fn limit_drops_oldest_text_on_char_boundary() {
		let mut t = Transcript::new(Some(4));
		t.append("abcdef");
		assert_eq!(t.as_str(), "cdef");
		t.append("é");
		assert_eq!(t.as_str(), "efé");
		assert!(t.len() <= 4);
	}

	#[test]
	fn zero_limit_means_unbounded() {
		let mut t = Transcript::new(Some(0));
		t.append(&"x".repeat(10_000));
		assert_eq!(t.len(), 10_000);
	}
}
