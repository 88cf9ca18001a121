//! Prompt templates. Placeholders use `{name}` and are filled by [`render`].

/// Structure used when the configuration does not provide one.
pub const DEFAULT_REPORT_STRUCTURE: &str = "Use this structure to create a report on the user-provided topic:

1. Introduction (no research needed)
   - Brief overview of the topic area

2. Main Body Sections:
   - Each section should focus on a sub-topic of the user-provided topic

3. Conclusion
   - Aim for 1 structural element (either a list or table) that distills the main body sections
   - Provide a concise summary of the report";

pub const PLANNER_QUERY_WRITER: &str = "You are performing research for a report.

<Report topic>
{topic}
</Report topic>

<Report organization>
{report_organization}
</Report organization>

<Task>
Your goal is to generate {number_of_queries} web search queries that will help gather information for planning the report sections.

The queries should:
1. Be related to the topic of the report
2. Help satisfy the requirements specified in the report organization

Make the queries specific enough to find high-quality, relevant sources while covering the breadth needed for the report structure.
</Task>

Today's date is {today}.";

pub const PLANNER_QUERY_WRITER_USER: &str =
    "Generate search queries that will help with planning the sections of the report.";

pub const PLANNER_SECTIONS: &str = "I want a plan for a report that is concise and focused.

<Report topic>
The topic of the report is:
{topic}
</Report topic>

<Report organization>
The report should follow this organization:
{report_organization}
</Report organization>

<Context>
Here is context to use to plan the sections of the report:
{context}
</Context>

<Task>
Generate a list of sections for the report. Your plan should be tight and focused with NO overlapping sections or unnecessary filler.

Each section should have the fields:
- name: Name for this section of the report.
- description: Brief overview of the main topics covered in this section.
- research: Whether to perform web research for this section of the report.
- content: The content of the section, which you will leave blank for now.

Integration guidelines:
- Include examples and implementation details within main topic sections, not as separate sections
- Ensure each section has a distinct purpose with no content overlap
- Combine related concepts rather than separating them

Before submitting, review your structure to ensure it has no redundant sections and follows a logical flow.
</Task>

<Feedback>
Here is feedback on the report structure from review (if any):
{feedback}
</Feedback>";

pub const PLANNER_SECTIONS_USER: &str = "Generate the sections of the report. Your response must include a 'sections' field containing a list of sections. Each section must have: name, description, research, and content fields.";

pub const SECTION_QUERY_WRITER: &str = "You are an expert technical writer crafting targeted web search queries that will gather comprehensive information for writing a technical report section.

<Report topic>
{topic}
</Report topic>

<Section topic>
{section_topic}
</Section topic>

<Task>
Your goal is to generate {number_of_queries} search queries that will help gather comprehensive information about the section topic.

The queries should:
1. Be related to the topic
2. Examine different aspects of the topic

Make the queries specific enough to find high-quality, relevant sources.
</Task>

Today's date is {today}.";

pub const SECTION_QUERY_WRITER_USER: &str = "Generate search queries on the provided topic.";

pub const SECTION_WRITER: &str = "Write one section of a research report.

<Task>
1. Review the report topic, section name, and section topic carefully.
2. If present, review any existing section content.
3. Then, look at the provided Source material.
4. Decide the sources that you will use to write a report section.
5. Write the report section and list your sources.
</Task>

<Writing Guidelines>
- If existing section content is not populated, write from scratch
- If existing section content is populated, synthesize it with the source material
- Strict 150-200 word limit
- Use simple, clear language
- Use short paragraphs (2-3 sentences max)
- Use ## for section title (Markdown format)
</Writing Guidelines>

<Citation Rules>
- Assign each unique URL a single citation number in your text
- End with ### Sources that lists each source with corresponding numbers
- Number sources sequentially without gaps (1,2,3,4...) in the final list
</Citation Rules>

Today's date is {today}.";

pub const SECTION_WRITER_INPUTS: &str = "<Report topic>
{topic}
</Report topic>

<Section name>
{section_name}
</Section name>

<Section topic>
{section_topic}
</Section topic>

<Existing section content (if populated)>
{section_content}
</Existing section content>

<Source material>
{context}
</Source material>";

pub const SECTION_GRADER: &str = "Review a report section relative to the specified topic:

<Report topic>
{topic}
</Report topic>

<Section topic>
{section_topic}
</Section topic>

<Section content>
{section}
</Section content>

<Task>
Evaluate whether the section content adequately addresses the section topic.

If the section content does not adequately address the section topic, generate {number_of_follow_up_queries} follow-up search queries to gather missing information.
</Task>

<Format>
Respond with a grade of \"pass\" or \"fail\" and a list of follow-up search queries.
</Format>";

pub const SECTION_GRADER_USER: &str = "Grade the report and consider follow-up questions for missing information. If the grade is 'pass', return an empty list of follow-up queries. If the grade is 'fail', provide specific search queries to gather missing information.";

pub const FINAL_SECTION_WRITER: &str = "You are an expert technical writer crafting a section that synthesizes information from the rest of the report.

<Report topic>
{topic}
</Report topic>

<Section name>
{section_name}
</Section name>

<Section topic>
{section_topic}
</Section topic>

<Available report content>
{context}
</Available report content>

<Task>
1. Section-Specific Approach:

For Introduction:
- Use # for report title (Markdown format)
- 50-100 word limit
- Write in simple and clear language
- Focus on the core motivation for the report in 1-2 paragraphs
- Do not include structural elements (no lists or tables)
- No sources section needed

For Conclusion/Summary:
- Use ## for section title (Markdown format)
- 100-150 word limit
- Include at most one structural element (a focused comparison table or a short list)
- End with specific next steps or implications
- No sources section needed

2. Writing Approach:
- Use concrete details over general statements
- Make every word count
- Focus on your single most important point
</Task>";

pub const FINAL_SECTION_WRITER_USER: &str =
    "Generate a report section based on the provided sources.";

pub const RETRIEVAL_DECIDE: &str = "You answer questions for a user who may need information from a private knowledge base.

Decide whether the question can be answered directly from general knowledge or whether the knowledge base must be searched.

- To search, respond with action \"retrieve\" and a concise search query.
- To answer directly, respond with action \"respond\" and the complete answer.

Today's date is {today}.";

pub const RETRIEVAL_GRADER: &str = "You are a grader assessing relevance of retrieved documents to a user question.

Here is the retrieved document:

{context}

Here is the user question: {question}

If the document contains keyword(s) or semantic meaning related to the user question, grade it as relevant.
Give a binary score 'yes' or 'no' to indicate whether the document is relevant to the question.";

pub const RETRIEVAL_REWRITER: &str = "Look at the input and try to reason about the underlying semantic intent or meaning.

Here is the initial question:
-------
{question}
-------
Formulate an improved question. Respond with the question only.";

pub const RETRIEVAL_ANSWER: &str = "You are an assistant for question-answering tasks. Use only the following pieces of retrieved context to answer the question. If the context does not contain the answer, say that you don't know. Use three sentences maximum and keep the answer concise.

Question: {question}

Context: {context}";

/// Substitute `{key}` placeholders in a single pass, so braces inside
/// substituted values are never expanded. Unknown placeholders are left untouched.
pub fn render(template: &str, values: &[(&str, &str)]) -> String {
    let mut output = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(open) = rest.find('{') {
        output.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        let replacement = after.find('}').and_then(|close| {
            let key = &after[..close];
            values
                .iter()
                .find(|(name, _)| *name == key)
                .map(|(_, value)| (close, *value))
        });
        match replacement {
            Some((close, value)) => {
                output.push_str(value);
                rest = &after[close + 1..];
            }
            None => {
                output.push('{');
                rest = after;
            }
        }
    }

    output.push_str(rest);
    output
}

/// Current date in the long form used by every dated prompt, e.g. `Mon Jan 15, 2024`.
pub fn today() -> String {
    chrono::Local::now().format("%a %b %-d, %Y").to_string()
}
