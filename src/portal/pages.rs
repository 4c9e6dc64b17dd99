//! HTML pages

use std::fmt::Write as _;

use serde_json::Value;

const STYLE: &str = "body{font-family:sans-serif;margin:2rem auto;max-width:60rem;color:#222}\
nav a{margin-right:1rem}\
.row{display:flex;gap:2rem;align-items:flex-start}\
.card{display:flex;flex-direction:column;gap:.5rem;padding:1rem;border:1px solid #ddd;border-radius:4px}\
.error{color:#a00}\
pre{background:#f6f6f6;padding:1rem;overflow:auto}";

/// Escape text for use in HTML element content and attribute values
#[must_use]
pub fn escape_html(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#x27;"),
            c => escaped.push(c),
        }
    }
    escaped
}

/// Full document around `body`. `body` is trusted markup.
pub(crate) fn layout(title: &str, body: &str) -> String {
    format!(
        "<!DOCTYPE html>\n<html lang=\"en\">\n<head>\n<meta charset=\"utf-8\">\n\
         <title>{}</title>\n<style>{STYLE}</style>\n</head>\n<body>\n{body}</body>\n</html>\n",
        escape_html(title)
    )
}

fn nav() -> &'static str {
    "<nav><a href=\"/\">Home</a><a href=\"/menu\">Dashboards</a><a href=\"/logout\">Sign out</a></nav>\n"
}

pub(crate) fn index(first_name: &str) -> String {
    let greeting = if first_name.is_empty() {
        "Welcome".to_string()
    } else {
        format!("Welcome, {}", escape_html(first_name))
    };
    layout(
        "Dashboard portal",
        &format!(
            "{}<h1>{greeting}</h1>\n<p><a href=\"/menu\">Open the dashboard menu</a></p>\n",
            nav()
        ),
    )
}

pub(crate) fn not_signed_in(auth_uri: &str) -> String {
    layout(
        "Not signed in",
        &format!(
            "<h1>You are not signed in</h1>\n<p><a href=\"{}\">Sign in</a> to continue.</p>\n",
            escape_html(auth_uri)
        ),
    )
}

pub(crate) fn access_denied() -> String {
    layout(
        "Access denied",
        "<h1>Access denied</h1>\n\
         <p>Your account does not have a role that grants access to this portal.</p>\n\
         <p><a href=\"/logout\">Sign in with another account</a></p>\n",
    )
}

pub(crate) fn auth_error(error: &str, description: &str) -> String {
    layout(
        "Sign-in failed",
        &format!(
            "<h1 class=\"error\">Sign-in failed</h1>\n<h2>{}</h2>\n<pre>{}</pre>\n\
             <p><a href=\"/\">Try again</a></p>\n",
            escape_html(error),
            escape_html(description)
        ),
    )
}

pub(crate) fn menu(name: &str, dashboards: &[(String, String)]) -> String {
    let mut body = String::from(nav());
    let _ = writeln!(body, "<h1>Dashboards</h1>\n<p>Signed in as {}</p>", escape_html(name));
    if dashboards.is_empty() {
        body.push_str("<p>No dashboards are available.</p>\n");
    } else {
        body.push_str("<ul>\n");
        for (title, url) in dashboards {
            let _ = writeln!(
                body,
                "<li><a href=\"{}\">{}</a></li>",
                escape_html(url),
                escape_html(title)
            );
        }
        body.push_str("</ul>\n");
    }
    layout("Dashboards", &body)
}

pub(crate) fn display(result: &Value) -> String {
    let pretty = serde_json::to_string_pretty(result).unwrap_or_else(|_| result.to_string());
    layout(
        "Graph API call result",
        &format!(
            "{}<h1>Graph API call result</h1>\n<pre>{}</pre>\n",
            nav(),
            escape_html(&pretty)
        ),
    )
}

pub(crate) fn dashboard(title: &str, content: &str) -> String {
    layout(title, &format!("{}{content}", nav()))
}

pub(crate) fn error(title: &str, message: &str) -> String {
    layout(
        title,
        &format!(
            "{}<h1 class=\"error\">{}</h1>\n<pre>{}</pre>\n",
            nav(),
            escape_html(title),
            escape_html(message)
        ),
    )
}
