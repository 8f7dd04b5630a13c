//! Interactive sample review over stdin/stdout.

use anyhow::Result;
use facegallery_store::{GalleryStore, Person, ReviewAction, ReviewReport, SampleEdit};
use std::io::{BufRead, Write};

/// Reviewer input for one sample.
#[derive(Debug, PartialEq, Eq)]
enum Answer {
    Action(ReviewAction),
    /// Accept the rest of this person's samples.
    SkipPerson,
    /// Stop prompting and apply what was collected so far.
    Finish,
}

fn parse_answer(line: &str) -> Option<Answer> {
    let line = line.trim();
    let (cmd, rest) = match line.split_once(char::is_whitespace) {
        Some((cmd, rest)) => (cmd, rest.trim()),
        None => (line, ""),
    };
    match cmd {
        "" | "a" | "accept" => Some(Answer::Action(ReviewAction::Accept)),
        "d" | "delete" => Some(Answer::Action(ReviewAction::Delete)),
        "r" | "rename" if !rest.is_empty() => Some(Answer::Action(ReviewAction::Rename(rest.to_string()))),
        "s" | "skip" => Some(Answer::SkipPerson),
        "q" | "quit" => Some(Answer::Finish),
        _ => None,
    }
}

/// Read one line; `None` at end of input.
fn read_line<R: BufRead>(input: &mut R) -> Result<Option<String>> {
    let mut line = String::new();
    if input.read_line(&mut line)? == 0 {
        return Ok(None);
    }
    Ok(Some(line))
}

/// Prompt for every sample of `persons`, collecting the edits.
fn collect_edits<R: BufRead, W: Write>(persons: &[Person], input: &mut R, out: &mut W) -> Result<Vec<SampleEdit>> {
    let mut edits = Vec::new();
    'persons: for person in persons {
        writeln!(
            out,
            "\n{} ({}), {} sample(s), threshold {:.3}",
            person.name,
            person.global_id,
            person.faces.len(),
            person.classification_threshold
        )?;
        for face in &person.faces {
            loop {
                write!(out, "  {} [a]ccept / [r]ename <name> / [d]elete / [s]kip / [q]uit: ", face.image_path.display())?;
                out.flush()?;
                let Some(line) = read_line(input)? else {
                    break 'persons;
                };
                match parse_answer(&line) {
                    Some(Answer::Action(action)) => {
                        edits.push(SampleEdit::new(&person.global_id, &face.id, action));
                        break;
                    }
                    Some(Answer::SkipPerson) => continue 'persons,
                    Some(Answer::Finish) => break 'persons,
                    None => writeln!(out, "  unrecognized answer")?,
                }
            }
        }
    }
    Ok(edits)
}

/// Walk `persons` sample by sample, then apply the collected edits.
///
/// Conflicting labels for one person are settled by a second prompt; an
/// empty answer leaves that person unchanged.
pub fn run<R: BufRead, W: Write>(
    store: &GalleryStore,
    persons: &[Person],
    input: &mut R,
    out: &mut W,
) -> Result<ReviewReport> {
    let edits = collect_edits(persons, input, out)?;
    if edits.is_empty() {
        return Ok(ReviewReport::default());
    }

    let mut prompt_error = None;
    let mut resolver = |person: &Person, labels: &[String]| -> Option<String> {
        let answer = (|| -> Result<Option<String>> {
            writeln!(out, "\n{} received several labels:", person.global_id)?;
            for (i, label) in labels.iter().enumerate() {
                writeln!(out, "  {}) {label}", i + 1)?;
            }
            write!(out, "  pick a number or type a name (empty keeps {}): ", person.name)?;
            out.flush()?;
            let line = read_line(input)?.unwrap_or_default();
            let line = line.trim();
            Ok(match line.parse::<usize>() {
                Ok(n) if (1..=labels.len()).contains(&n) => Some(labels[n - 1].clone()),
                _ if line.is_empty() => None,
                _ => Some(line.to_string()),
            })
        })();
        answer.unwrap_or_else(|e| {
            prompt_error = Some(e);
            None
        })
    };
    let report = store.apply_edits(&edits, &mut resolver)?;
    if let Some(e) = prompt_error {
        return Err(e);
    }
    Ok(report)
}

pub fn print_report<W: Write>(report: &ReviewReport, out: &mut W) -> Result<()> {
    writeln!(out, "\nRenamed: {}", report.renamed.len())?;
    for (id, name) in &report.renamed {
        writeln!(out, "  {id} -> {name}")?;
    }
    writeln!(out, "Deleted samples: {}", report.deleted_samples)?;
    for id in &report.removed_persons {
        writeln!(out, "  removed person {id}")?;
    }
    for id in &report.unresolved {
        writeln!(out, "Unresolved label conflict: {id}")?;
    }
    for (id, err) in &report.errors {
        writeln!(out, "Error for {id}: {err}")?;
    }
    Ok(())
}
