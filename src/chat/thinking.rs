//! Placeholder "thinking" transcript shown while a reply is pending.
//!
//! The text is produced locally from the query alone. It is not a reasoning
//! trace from the model.

/// Step headings, each followed by its bullet points.
const STEPS: [(&str, [&str; 3]); 5] = [
    (
        "Understand the Query",
        [
            "Work out what kind of answer is being asked for",
            "Pick out the key terms and concepts",
            "Note any constraints stated in the question",
        ],
    ),
    (
        "Recall Relevant Knowledge",
        [
            "Gather what is known about the topic",
            "Consider several angles on the question",
            "Connect the concepts the query mentions",
        ],
    ),
    (
        "Compare Approaches",
        [
            "List the candidate answers",
            "Weigh the different interpretations",
            "Keep the most relevant and accurate material",
        ],
    ),
    (
        "Structure the Response",
        [
            "Order the points so they read logically",
            "Choose a format that is easy to scan",
            "Make sure the answer addresses the actual need",
        ],
    ),
    (
        "Check the Answer",
        [
            "Look for mistakes and missing pieces",
            "Confirm the claims are well supported",
            "Resolve any inconsistencies",
        ],
    ),
];

/// Markdown transcript for `query`. Same input, same output.
#[must_use]
pub fn thinking_transcript(query: &str) -> String {
    let query = query.trim();
    let mut out = format!("Working through the query: \"{query}\"\n");

    for (index, (heading, points)) in STEPS.iter().enumerate() {
        out.push('\n');
        out.push_str(&format!("{}. **{heading}**\n", index + 1));
        if index == 0 {
            out.push_str(&format!("   - The question is: \"{query}\"\n"));
        }
        for point in points {
            out.push_str(&format!("   - {point}\n"));
        }
    }

    out.trim_end().to_string()
}
