//! Textbook content: the sentence picker tree used when building assignments,
//! and the practice-test builders used from the student view.

use std::path::Path;

use rand::seq::SliceRandom;
use rand::Rng;
use serde::Deserialize;

use crate::error::{AppError, AppResult};

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Sentence {
    pub en: String,
    #[serde(default)]
    pub ja: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Section {
    pub title: String,
    #[serde(default)]
    pub sentences: Vec<Sentence>,
}

/// A chapter or lesson.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Unit {
    pub title: String,
    #[serde(default)]
    pub sections: Vec<Section>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Book {
    pub title: String,
    #[serde(default)]
    pub units: Vec<Unit>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Library {
    pub books: Vec<Book>,
}

impl Library {
    pub async fn load(path: &Path) -> AppResult<Self> {
        let raw = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| AppError::Validation(format!("cannot read {}: {e}", path.display())))?;
        serde_json::from_str(&raw)
            .map_err(|e| AppError::Validation(format!("{} is not valid content: {e}", path.display())))
    }

    fn book(&self, title: &str) -> AppResult<&Book> {
        self.books
            .iter()
            .find(|b| b.title == title)
            .ok_or_else(|| AppError::Validation(format!("unknown book '{title}'")))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckState {
    Unchecked,
    Checked,
    Indeterminate,
}

#[derive(Debug, Clone, PartialEq)]
pub enum NodeKind {
    Group,
    Sentence(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ContentNode {
    pub label: String,
    pub kind: NodeKind,
    pub state: CheckState,
    pub children: Vec<ContentNode>,
}

impl ContentNode {
    fn group(label: &str, children: Vec<ContentNode>) -> Self {
        Self {
            label: label.to_string(),
            kind: NodeKind::Group,
            state: CheckState::Unchecked,
            children,
        }
    }

    fn sentence(text: &str) -> Self {
        Self {
            label: text.to_string(),
            kind: NodeKind::Sentence(text.to_string()),
            state: CheckState::Unchecked,
            children: Vec::new(),
        }
    }

    /// Root → book → unit → section → sentence.
    pub fn from_library(library: &Library) -> Self {
        let books = library
            .books
            .iter()
            .map(|book| {
                let units = book
                    .units
                    .iter()
                    .map(|unit| {
                        let sections = unit
                            .sections
                            .iter()
                            .map(|section| {
                                let sentences =
                                    section.sentences.iter().map(|s| Self::sentence(&s.en)).collect();
                                Self::group(&section.title, sentences)
                            })
                            .collect();
                        Self::group(&unit.title, sections)
                    })
                    .collect();
                Self::group(&book.title, units)
            })
            .collect();
        Self::group("", books)
    }

    pub fn node(&self, path: &[usize]) -> Option<&ContentNode> {
        match path.split_first() {
            None => Some(self),
            Some((index, rest)) => self.children.get(*index)?.node(rest),
        }
    }

    /// Resolves a path from child labels, e.g. `["MY WAY", "Lesson 1", "Part 2"]`.
    pub fn path_by_labels(&self, labels: &[&str]) -> Option<Vec<usize>> {
        let mut path = Vec::with_capacity(labels.len());
        let mut current = self;
        for label in labels {
            let index = current.children.iter().position(|c| c.label == *label)?;
            path.push(index);
            current = &current.children[index];
        }
        Some(path)
    }

    fn set_subtree(&mut self, checked: bool) {
        self.state = if checked {
            CheckState::Checked
        } else {
            CheckState::Unchecked
        };
        for child in &mut self.children {
            child.set_subtree(checked);
        }
    }

    /// Recomputes group states bottom-up and reports whether any sentence lies below.
    /// Groups with no sentences keep their own state and do not count toward the parent.
    fn normalize(&mut self) -> bool {
        if matches!(self.kind, NodeKind::Sentence(_)) {
            return true;
        }
        let mut states = Vec::with_capacity(self.children.len());
        for child in &mut self.children {
            if child.normalize() {
                states.push(child.state);
            }
        }
        if states.is_empty() {
            return false;
        }
        let all_checked = states.iter().all(|s| *s == CheckState::Checked);
        let none_checked = states.iter().all(|s| *s == CheckState::Unchecked);
        self.state = if all_checked {
            CheckState::Checked
        } else if none_checked {
            CheckState::Unchecked
        } else {
            CheckState::Indeterminate
        };
        true
    }

    pub fn selected_sentences(&self) -> Vec<String> {
        let mut out = Vec::new();
        self.collect_selected(&mut out);
        out
    }

    fn collect_selected(&self, out: &mut Vec<String>) {
        match &self.kind {
            NodeKind::Sentence(text) if self.state == CheckState::Checked => out.push(text.clone()),
            NodeKind::Sentence(_) => {}
            NodeKind::Group => {
                for child in &self.children {
                    child.collect_selected(out);
                }
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PickerAction {
    /// Check or uncheck a node; groups cascade to every descendant.
    SetChecked { path: Vec<usize>, checked: bool },
}

pub fn reduce(tree: &ContentNode, action: &PickerAction) -> ContentNode {
    let mut next = tree.clone();
    let PickerAction::SetChecked { path, checked } = action;
    let mut target = Some(&mut next);
    for index in path {
        target = target.and_then(|node| node.children.get_mut(*index));
    }
    if let Some(node) = target {
        node.set_subtree(*checked);
    }
    next.normalize();
    next
}

#[derive(Debug, Clone, PartialEq)]
pub struct PracticeTest {
    pub title: String,
    pub questions: Vec<String>,
}

/// Random sample of `count` sentences drawn from the chosen units of one book.
pub fn unit_review<R: Rng + ?Sized>(
    library: &Library,
    book_title: &str,
    unit_titles: &[String],
    count: usize,
    rng: &mut R,
) -> AppResult<PracticeTest> {
    if unit_titles.is_empty() {
        return Err(AppError::Validation("select at least one chapter".into()));
    }
    let book = library.book(book_title)?;
    let mut sentences: Vec<String> = book
        .units
        .iter()
        .filter(|unit| unit_titles.contains(&unit.title))
        .flat_map(|unit| unit.sections.iter())
        .flat_map(|section| section.sentences.iter().map(|s| s.en.clone()))
        .collect();
    if sentences.is_empty() || count == 0 {
        return Err(AppError::Validation("the selected range has no questions".into()));
    }

    sentences.shuffle(rng);
    sentences.truncate(count);
    Ok(PracticeTest {
        title: format!("{} 復習 ({})", book.title, unit_titles.join(", ")),
        questions: sentences,
    })
}

/// Every sentence of one section, in textbook order.
pub fn section_test(
    library: &Library,
    book_title: &str,
    unit_title: &str,
    section_title: &str,
) -> AppResult<PracticeTest> {
    let book = library.book(book_title)?;
    let section = book
        .units
        .iter()
        .find(|u| u.title == unit_title)
        .and_then(|u| u.sections.iter().find(|s| s.title == section_title))
        .ok_or_else(|| {
            AppError::Validation(format!("unknown section '{unit_title} - {section_title}'"))
        })?;
    if section.sentences.is_empty() {
        return Err(AppError::Validation("the selected range has no questions".into()));
    }
    Ok(PracticeTest {
        title: format!("{unit_title} - {section_title}"),
        questions: section.sentences.iter().map(|s| s.en.clone()).collect(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn library() -> Library {
        serde_json::from_value(serde_json::json!({
            "books": [
                {
                    "title": "FACTBOOK",
                    "units": [
                        { "title": "Chapter 1", "sections": [
                            { "title": "A", "sentences": [{ "en": "One." }, { "en": "Two." }] },
                            { "title": "B", "sentences": [{ "en": "Three." }] }
                        ]},
                        { "title": "Chapter 2", "sections": [
                            { "title": "A", "sentences": [{ "en": "Four." }, { "en": "Five." }] }
                        ]}
                    ]
                },
                {
                    "title": "MY WAY",
                    "units": [
                        { "title": "Lesson 1", "sections": [
                            { "title": "Part 1", "sentences": [{ "en": "Hello.", "ja": "こんにちは。" }] },
                            { "title": "Empty", "sentences": [] }
                        ]}
                    ]
                }
            ]
        }))
        .unwrap()
    }

    #[test]
    fn checking_a_group_cascades_down_and_marks_parents() {
        let tree = ContentNode::from_library(&library());
        let chapter_one = tree.path_by_labels(&["FACTBOOK", "Chapter 1"]).unwrap();
        let tree = reduce(&tree, &PickerAction::SetChecked { path: chapter_one, checked: true });

        assert_eq!(tree.selected_sentences(), vec!["One.", "Two.", "Three."]);
        assert_eq!(tree.node(&[0]).unwrap().state, CheckState::Indeterminate);
        assert_eq!(tree.node(&[0, 0, 1]).unwrap().state, CheckState::Checked);
        assert_eq!(tree.node(&[1]).unwrap().state, CheckState::Unchecked);
    }

    #[test]
    fn unchecking_one_sentence_makes_ancestors_indeterminate() {
        let tree = ContentNode::from_library(&library());
        let tree = reduce(&tree, &PickerAction::SetChecked { path: vec![0], checked: true });
        assert_eq!(tree.node(&[0]).unwrap().state, CheckState::Checked);

        let tree = reduce(&tree, &PickerAction::SetChecked { path: vec![0, 0, 0, 1], checked: false });
        assert_eq!(tree.node(&[0, 0, 0]).unwrap().state, CheckState::Indeterminate);
        assert_eq!(tree.node(&[0, 0]).unwrap().state, CheckState::Indeterminate);
        assert_eq!(tree.node(&[0, 1]).unwrap().state, CheckState::Checked);
        assert_eq!(tree.selected_sentences(), vec!["One.", "Three.", "Four.", "Five."]);

        let tree = reduce(&tree, &PickerAction::SetChecked { path: vec![0, 0, 0, 1], checked: true });
        assert_eq!(tree.node(&[0]).unwrap().state, CheckState::Checked);

        let cleared = reduce(&tree, &PickerAction::SetChecked { path: vec![0], checked: false });
        assert!(cleared.selected_sentences().is_empty());
    }

    #[test]
    fn sentence_free_sections_do_not_hold_parents_indeterminate() {
        let tree = ContentNode::from_library(&library());
        let my_way = tree.path_by_labels(&["MY WAY"]).unwrap();
        let tree = reduce(&tree, &PickerAction::SetChecked { path: my_way, checked: true });
        assert_eq!(tree.node(&[1]).unwrap().state, CheckState::Checked);

        let hello = tree.path_by_labels(&["MY WAY", "Lesson 1", "Part 1", "Hello."]).unwrap();
        let tree = reduce(&tree, &PickerAction::SetChecked { path: hello, checked: false });
        assert!(tree.selected_sentences().is_empty());
        assert_eq!(tree.node(&[1, 0]).unwrap().state, CheckState::Unchecked);
        assert_eq!(tree.node(&[1]).unwrap().state, CheckState::Unchecked);
        assert_eq!(tree.state, CheckState::Unchecked);
    }

    #[test]
    fn unknown_paths_leave_selection_unchanged() {
        let tree = ContentNode::from_library(&library());
        let next = reduce(&tree, &PickerAction::SetChecked { path: vec![9, 9], checked: true });
        assert!(next.selected_sentences().is_empty());
        assert!(tree.path_by_labels(&["FACTBOOK", "Chapter 9"]).is_none());
    }

    #[test]
    fn unit_review_samples_from_selected_units() {
        let mut rng = StdRng::seed_from_u64(7);
        let units = vec!["Chapter 2".to_string()];
        let test = unit_review(&library(), "FACTBOOK", &units, 5, &mut rng).unwrap();
        assert_eq!(test.title, "FACTBOOK 復習 (Chapter 2)");
        let mut questions = test.questions.clone();
        questions.sort();
        assert_eq!(questions, vec!["Five.", "Four."]);

        let sampled = unit_review(&library(), "FACTBOOK", &["Chapter 1".to_string()], 2, &mut rng).unwrap();
        assert_eq!(sampled.questions.len(), 2);

        assert!(unit_review(&library(), "FACTBOOK", &[], 5, &mut rng).is_err());
    }

    #[test]
    fn section_test_uses_every_sentence() {
        let test = section_test(&library(), "MY WAY", "Lesson 1", "Part 1").unwrap();
        assert_eq!(test.title, "Lesson 1 - Part 1");
        assert_eq!(test.questions, vec!["Hello."]);
        assert!(section_test(&library(), "MY WAY", "Lesson 1", "Empty").is_err());
        assert!(section_test(&library(), "MY WAY", "Lesson 2", "Part 1").is_err());
    }
}
