//! Welcome banner templating.
//!
//! The banner file is plain text with placeholder tokens that are
//! substituted per session before being written to an interactive shell.

/// Substitution context for one session.
pub struct BannerContext<'a> {
    pub instance_user: &'a str,
    pub instance: &'a str,
    pub project: &'a str,
    pub remote: &'a str,
    pub hostname: &'a str,
}

/// Replace the `[TOKEN]` placeholders in a banner template.
pub fn render(template: &str, ctx: &BannerContext<'_>) -> String {
    template
        .replace("[INSTANCE_USER]", ctx.instance_user)
        .replace("[INSTANCE]", ctx.instance)
        .replace("[PROJECT]", ctx.project)
        .replace("[REMOTE]", ctx.remote)
        .replace("[HOSTNAME]", ctx.hostname)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replaces_all_tokens() {
        let ctx = BannerContext {
            instance_user: "dev",
            instance: "web",
            project: "prod",
            remote: "local",
            hostname: "host1",
        };
        let out = render(
            "Welcome [INSTANCE_USER]@[INSTANCE].[PROJECT] ([REMOTE]) via [HOSTNAME]\n",
            &ctx,
        );
        assert_eq!(out, "Welcome dev@web.prod (local) via host1\n");
    }

    #[test]
    fn unknown_tokens_are_left_alone() {
        let ctx = BannerContext {
            instance_user: "root",
            instance: "box",
            project: "default",
            remote: "",
            hostname: "h",
        };
        assert_eq!(render("[WHATEVER]", &ctx), "[WHATEVER]");
    }
}
