//! Build-script generation: render validated [`Settings`] into the Makefile
//! the pipeline's build tool runs.

use annotate_shared::{DEFAULT_ROOT, Settings};

/// Renders the build script for a set of settings.
///
/// Output must be a pure function of the settings; it feeds the fingerprint.
pub trait ScriptGenerator: Send + Sync {
    fn generate(&self, settings: &Settings) -> String;
}

/// The stock Makefile generator.
#[derive(Debug, Clone, Copy, Default)]
pub struct MakefileGenerator;

/// Annotation files and column names always present.
const WORD: (&str, &str) = ("word", "word");

/// Extra XML mappings for languages analysed by FreeLing.
const FREELING_XML: &[(&str, &str)] = &[
    ("s", "sentence"),
    ("w", "token"),
    ("w:pos", "token.pos"),
    ("w:msd", "token.msd"),
    ("w:lemma", "token.baseform"),
];

enum Row {
    Line(String),
    Assign(String, String),
    /// Rows of `name = values...`, columns aligned.
    Table(Vec<(String, Vec<String>)>),
}

impl Row {
    fn blank() -> Self {
        Self::Line(String::new())
    }

    fn assign(key: &str, value: impl Into<String>) -> Self {
        Self::Assign(key.into(), value.into())
    }

    fn comment(text: &str) -> Self {
        Self::Line(format!("# {text}"))
    }

    /// Two-row table from a list of (left, right) pairs.
    fn pairs(left: &str, right: &str, pairs: &[(String, String)]) -> Self {
        let (l, r): (Vec<_>, Vec<_>) = pairs.iter().cloned().unzip();
        Self::Table(vec![(left.into(), l), (right.into(), r)])
    }
}

impl ScriptGenerator for MakefileGenerator {
    fn generate(&self, settings: &Settings) -> String {
        let root = settings.root.tag.as_str();
        let freeling = settings.lang.is_freeling();

        let mut columns: Vec<(String, String)> = vec![(WORD.0.into(), WORD.1.into())];
        let mut positional = settings.positional_attributes.clone();
        positional.sort();
        columns.extend(
            positional
                .iter()
                .map(|attr| (attr.annotation().to_string(), attr.column().to_string())),
        );

        let mut structs: Vec<(String, String)> = Vec::new();
        let mut xml: Vec<(String, String)> = Vec::new();

        for ne in &settings.named_entity_recognition {
            structs.push((format!("ne.{}", ne.name()), format!("ne:{}", ne.name())));
        }
        structs.push(("sentence.id".into(), "sentence:id".into()));

        let mut segmentation = Vec::new();
        if !freeling {
            segmentation.push(Row::assign("token_chunk", "sentence"));
            segmentation.push(Row::assign(
                "token_segmenter",
                settings.word_segmenter.word(),
            ));
            segmentation.push(Row::blank());

            let sentence = &settings.sentence_segmentation;
            segmentation.push(Row::assign("sentence_chunk", sentence.sentence_chunk.name()));
            segmentation.push(Row::assign(
                "sentence_segmenter",
                sentence.sentence_segmenter.sentence(),
            ));
            segmentation.push(Row::blank());

            match settings.paragraph_segmentation.segmenter() {
                Some(segmenter) => {
                    structs.push(("paragraph.n".into(), "paragraph".into()));
                    segmentation.push(Row::assign("paragraph_chunk", root));
                    segmentation.push(Row::assign("paragraph_segmenter", segmenter));
                }
                None => segmentation.push(Row::comment("No segmentation for paragraph")),
            }
            segmentation.push(Row::blank());
        }

        // The root element maps onto the `text` annotation, with its
        // attributes as structural attributes.
        xml.push((root.into(), DEFAULT_ROOT.into()));
        push_unique(&mut structs, (DEFAULT_ROOT.into(), root.into()));
        for attr in settings.root.attributes.iter().filter(|a| !a.is_empty()) {
            xml.push((format!("{root}:{attr}"), format!("{DEFAULT_ROOT}.{attr}")));
            push_unique(
                &mut structs,
                (format!("{DEFAULT_ROOT}.{attr}"), format!("{root}:{attr}")),
            );
        }

        if freeling {
            xml.extend(
                FREELING_XML
                    .iter()
                    .map(|(tag, annotation)| (tag.to_string(), annotation.to_string())),
            );
        }

        let mut rows = vec![
            Row::Line("include $(PIPELINE_MAKEFILES)/Makefile.config".into()),
            Row::assign("corpus", settings.corpus.as_str()),
            Row::assign("original_dir", "original"),
        ];

        let lang = settings.lang;
        if freeling {
            rows.push(Row::assign("lang", lang.code()));
            rows.push(Row::assign("analysis", lang.analysis()));
        } else if lang.code() == "sv-1800" {
            rows.push(Row::assign("analysis", lang.analysis()));
        }

        rows.extend([
            Row::blank(),
            Row::pairs("vrt_columns_annotations", "vrt_columns", &columns),
            Row::blank(),
            Row::pairs("vrt_structs_annotations", "vrt_structs", &structs),
            Row::blank(),
            Row::pairs("xml_elements", "xml_annotations", &xml),
            Row::blank(),
        ]);

        if !settings.named_entity_recognition.is_empty() {
            rows.push(Row::assign("ignore_missing_parents", "True"));
            rows.push(Row::blank());
        }

        rows.extend(segmentation);

        if freeling {
            rows.push(Row::assign("custom_rules", "xml"));
            rows.push(Row::blank());
        }

        rows.push(Row::Line("include $(PIPELINE_MAKEFILES)/Makefile.rules".into()));

        linearize(&rows)
    }
}

fn push_unique(list: &mut Vec<(String, String)>, item: (String, String)) {
    if !list.contains(&item) {
        list.push(item);
    }
}

fn linearize(rows: &[Row]) -> String {
    let mut out = Vec::new();
    for row in rows {
        match row {
            Row::Line(line) => out.push(line.clone()),
            Row::Assign(key, value) => out.push(format!("{key} = {value}")),
            Row::Table(entries) => out.extend(align_table(entries)),
        }
    }
    out.join("\n")
}

/// Lay out `name = v1 v2 ...` rows so that every column lines up. Short
/// rows are padded with `-`.
fn align_table(entries: &[(String, Vec<String>)]) -> Vec<String> {
    let rows: Vec<Vec<&str>> = entries
        .iter()
        .map(|(name, values)| {
            let mut row = vec![name.as_str(), "="];
            row.extend(values.iter().map(String::as_str));
            row
        })
        .collect();

    let width = rows.iter().map(Vec::len).max().unwrap_or(0);
    // Width 1 fits the `-` filler.
    let mut col_widths = vec![1; width];
    for row in &rows {
        for (i, cell) in row.iter().enumerate() {
            col_widths[i] = col_widths[i].max(cell.len());
        }
    }

    rows.iter()
        .map(|row| {
            (0..width)
                .map(|i| {
                    let cell = row.get(i).copied().unwrap_or("-");
                    format!("{cell:<w$}", w = col_widths[i])
                })
                .collect::<Vec<_>>()
                .join(" ")
                .trim_end()
                .to_string()
        })
        .collect()
}
