//! Built-in platform mail templates. `.html` templates are autoescaped.

use std::sync::LazyLock;

use tera::{Context, Tera};

const WELCOME_HTML: &str = r#"<html><body>
<h1>Welcome, {{ first_name }}!</h1>
<p>Your {{ product }} account for {{ email }} is ready.</p>
<p>Import your contacts, verify a sending domain and launch your first campaign whenever you are ready.</p>
</body></html>"#;

const WELCOME_TEXT: &str = "Welcome, {{ first_name }}!

Your {{ product }} account for {{ email }} is ready.
Import your contacts, verify a sending domain and launch your first campaign whenever you are ready.
";

const ADMIN_ALERT_HTML: &str = r#"<html><body>
<h2>[{{ kind }}] {{ title }}</h2>
<p>{{ message }}</p>
{% if company_id %}<p>Company: {{ company_id }}</p>{% endif %}
</body></html>"#;

static TEMPLATES: LazyLock<Tera> = LazyLock::new(|| {
    let mut tera = Tera::default();
    tera.add_raw_templates(vec![
        ("welcome.html", WELCOME_HTML),
        ("welcome.txt", WELCOME_TEXT),
        ("admin_alert.html", ADMIN_ALERT_HTML),
    ])
    .expect("built-in mail templates parse");
    tera
});

pub(crate) fn render(name: &str, ctx: &Context) -> Result<String, tera::Error> {
    TEMPLATES.render(name, ctx)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn html_templates_escape_user_input() {
        let mut ctx = Context::new();
        ctx.insert("first_name", "<b>Jane</b>");
        ctx.insert("email", "jane@example.com");
        ctx.insert("product", "Mailforge");

        let html = render("welcome.html", &ctx).unwrap();
        assert!(html.contains("Welcome, &lt;b&gt;Jane&lt;&#x2F;b&gt;!"));

        let text = render("welcome.txt", &ctx).unwrap();
        assert!(text.starts_with("Welcome, <b>Jane</b>!"));
    }

    #[test]
    fn admin_alert_omits_missing_company() {
        let mut ctx = Context::new();
        ctx.insert("kind", "warning");
        ctx.insert("title", "Bounce spike");
        ctx.insert("message", "Bounce rate above 5%");
        ctx.insert("company_id", &Option::<String>::None);

        let html = render("admin_alert.html", &ctx).unwrap();
        assert!(html.contains("[warning] Bounce spike"));
        assert!(!html.contains("Company:"));
    }
}
