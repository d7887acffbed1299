#[cfg(feature = "serde")]
mod serde_tests {
    use mantle::{Context, MantleError, Template};
    use serde::Serialize;

    #[derive(Serialize)]
    struct Author {
        name: String,
        tags: Vec<&'static str>,
    }

    #[derive(Serialize)]
    struct Page {
        title: &'static str,
        views: u32,
        rating: f64,
        draft: bool,
        author: Author,
    }

    #[test]
    fn test_context_from_serialize() {
        let page = Page {
            title: "Intro",
            views: 3,
            rating: 4.5,
            draft: false,
            author: Author {
                name: "ada".to_string(),
                tags: vec!["math", "engines"],
            },
        };
        let context = Context::from_serialize(&page).unwrap();
        assert_eq!(
            context.keys().collect::<Vec<_>>(),
            ["title", "views", "rating", "draft", "author"]
        );

        let template = Template::new(
            "${title} ${views + 1} ${rating} ${draft} ${author['name']} ${', '.join(author['tags'])}",
        )
        .unwrap();
        assert_eq!(
            template.render(&context).unwrap(),
            "Intro 4 4.5 False ada math, engines"
        );
    }

    #[test]
    fn test_context_from_non_object_fails() {
        let err = Context::from_serialize(&vec![1, 2, 3]).unwrap_err();
        assert_eq!(err.exception_name(), "TypeError");
    }

    #[test]
    fn test_template_serialization() {
        let template =
            Template::with_options("Hello, ${name}!", "/greeting.html", Default::default())
                .unwrap();

        let serialized = serde_json::to_string(&template).unwrap();
        assert_eq!(
            serialized,
            r#"{"uri":"/greeting.html","content":"Hello, ${name}!"}"#
        );

        let deserialized: Template = serde_json::from_str(&serialized).unwrap();
        assert_eq!(deserialized.uri(), "/greeting.html");

        let mut context = Context::new();
        context.insert("name", "World");
        assert_eq!(
            template.render(&context).unwrap(),
            deserialized.render(&context).unwrap()
        );
    }

    #[test]
    fn test_template_without_uri_deserializes() {
        let template: Template = serde_json::from_str(r#"{"content":"${1 + 1}"}"#).unwrap();
        assert!(template.uri().starts_with("memory:"));
        assert_eq!(template.render(&Context::new()).unwrap(), "2");
    }

    #[test]
    fn test_invalid_template_fails_to_deserialize() {
        let result = serde_json::from_str::<Template>(r#"{"content":"<%def>"}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_error_serialization() {
        let err = Template::new("${x").unwrap_err();
        let serialized = serde_json::to_string(&err).unwrap();
        let deserialized: MantleError = serde_json::from_str(&serialized).unwrap();
        assert_eq!(deserialized, err);
    }
}
