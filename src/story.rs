//! Client for the story/image generation backend. The core treats it as an
//! opaque producer of scene-shaped data; everything it returns is re-resolved
//! through [`SceneParser`] before the sequencer sees it.

use crate::config::StoryApiConfig;
use crate::error::{Error, Result};
use crate::script::{Character, ParsedScene, SceneDoc, SceneParser};
use log::warn;
use serde::{Deserialize, Serialize};

pub struct StoryClient {
    config: StoryApiConfig,
    client: reqwest::Client,
}

#[derive(Debug, Clone)]
pub struct ChildProfile {
    pub name: String,
    pub age: u32,
    pub interests: String,
}

#[derive(Serialize)]
struct GenerateRequest<'a> {
    child_name: &'a str,
    child_age: u32,
    child_interests: &'a str,
}

#[derive(Serialize)]
struct ImageRequest<'a> {
    prompt: &'a str,
}

#[derive(Debug, Deserialize)]
struct ImageResponse {
    image_path: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoryResponse {
    pub story: Story,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Story {
    pub main: StoryMain,
    pub characters: Vec<Character>,
    pub scenes: Vec<SceneDoc>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoryMain {
    pub title: String,
    /// Scene ids in narrative order.
    pub flow: Vec<String>,
}

impl Story {
    /// Scenes in flow order. Flow entries naming a missing scene are skipped.
    pub fn scenes_in_flow(&self) -> Vec<&SceneDoc> {
        self.main
            .flow
            .iter()
            .filter_map(|id| {
                let found = self.scenes.iter().find(|s| &s.id == id);
                if found.is_none() {
                    warn!("flow references unknown scene {}", id);
                }
                found
            })
            .collect()
    }

    /// Resolves the whole story into sequencer-ready scenes. Character
    /// references inside scene events are re-bound to this story's character
    /// list by name.
    pub fn parsed_scenes(&self) -> Vec<ParsedScene> {
        let parser = SceneParser::from_characters(self.characters.clone());
        self.scenes_in_flow()
            .into_iter()
            .map(|doc| parser.resolve_scene(doc))
            .collect()
    }
}

impl StoryClient {
    pub fn new(config: StoryApiConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
        }
    }

    fn with_credentials(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        let mut builder = builder;
        if let Some(code) = &self.config.access_code {
            builder = builder.header("X-Access-Code", code);
        }
        if let Some(key) = &self.config.api_key {
            builder = builder.header("X-OpenAI-Key", key);
        }
        builder
    }

    pub async fn generate_story(&self, profile: &ChildProfile) -> Result<StoryResponse> {
        let url = format!("{}/api/story/generate", self.config.base_url);
        let request = GenerateRequest {
            child_name: &profile.name,
            child_age: profile.age,
            child_interests: &profile.interests,
        };

        let response = self
            .with_credentials(self.client.post(&url).json(&request))
            .send()
            .await
            .map_err(|e| Error::Backend(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(match status.as_u16() {
                401 | 403 => Error::Authentication(body),
                _ => Error::Backend(format!("story generation failed ({}): {}", status, body)),
            });
        }

        response
            .json::<StoryResponse>()
            .await
            .map_err(|e| Error::Backend(format!("malformed story payload: {}", e)))
    }

    /// Generates a scene illustration; returns the image reference to use as
    /// scene decoration.
    pub async fn generate_image(&self, prompt: &str) -> Result<String> {
        let url = format!("{}/api/story/generate-image", self.config.base_url);
        let response = self
            .with_credentials(self.client.post(&url).json(&ImageRequest { prompt }))
            .send()
            .await
            .map_err(|e| Error::Backend(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Backend(format!(
                "image generation failed ({}): {}",
                status, body
            )));
        }

        let parsed = response
            .json::<ImageResponse>()
            .await
            .map_err(|e| Error::Backend(format!("malformed image payload: {}", e)))?;
        Ok(resolve_image_url(&self.config.base_url, &parsed.image_path))
    }
}

/// The backend returns paths relative to its own root; absolute URLs pass
/// through untouched.
fn resolve_image_url(base: &str, path: &str) -> String {
    url::Url::parse(base)
        .and_then(|base| base.join(path))
        .map(|resolved| resolved.to_string())
        .unwrap_or_else(|_| path.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::script::Voice;

    const STORY_JSON: &str = r#"{
        "story": {
            "main": {
                "title": "Xavier and the Star Rocket",
                "flow": ["rocket_intro", "moon_landing"]
            },
            "characters": [
                {
                    "name": "Narrator",
                    "prompt": "Warm storyteller",
                    "voice": "sage",
                    "personality": {"trait": "engaging", "goal": "guide", "speech_style": "warm"}
                },
                {
                    "name": "Captain Zip",
                    "prompt": "A cheerful rocket pilot",
                    "voice": "ash",
                    "personality": {"trait": "adventurous", "goal": "explore", "speech_style": "energetic"}
                }
            ],
            "scenes": [
                {
                    "id": "moon_landing",
                    "name": "The Moon",
                    "prompt": "a quiet crater",
                    "mood": "calm",
                    "time": "night",
                    "imageUrl": "",
                    "events": [
                        {"type": "narrate", "content": "The rocket settled into the dust.", "id": "", "order": 0}
                    ]
                },
                {
                    "id": "rocket_intro",
                    "name": "The Launch Pad",
                    "prompt": "a shiny rocket at dawn",
                    "mood": "exciting",
                    "time": "morning",
                    "imageUrl": "http://localhost:8000/images/1.png",
                    "events": [
                        {"type": "narrate", "content": "Look at that rocket!", "id": "", "order": 0},
                        {
                            "type": "speak",
                            "character": {"name": "Captain Zip"},
                            "content": "All aboard!",
                            "emotion": "welcoming",
                            "id": "",
                            "order": 1
                        }
                    ]
                }
            ]
        },
        "metadata": {"child_name": "Xavier", "id": "abc123"}
    }"#;

    #[test]
    fn deserializes_story_payload() {
        let response: StoryResponse = serde_json::from_str(STORY_JSON).unwrap();
        assert_eq!(response.story.main.title, "Xavier and the Star Rocket");
        assert_eq!(response.story.characters.len(), 2);
        assert_eq!(response.story.characters[1].voice, Voice::Ash);
        assert_eq!(response.metadata["child_name"], "Xavier");
    }

    #[test]
    fn flow_orders_and_filters_scenes() {
        let mut response: StoryResponse = serde_json::from_str(STORY_JSON).unwrap();
        response.story.main.flow.push("missing_scene".to_string());

        let ordered = response.story.scenes_in_flow();
        assert_eq!(ordered.len(), 2);
        assert_eq!(ordered[0].id, "rocket_intro");
        assert_eq!(ordered[1].id, "moon_landing");
    }

    #[test]
    fn parsed_scenes_rebind_characters() {
        let response: StoryResponse = serde_json::from_str(STORY_JSON).unwrap();
        let scenes = response.story.parsed_scenes();
        assert_eq!(scenes.len(), 2);

        let intro = &scenes[0];
        assert_eq!(intro.id, "rocket_intro");
        assert_eq!(intro.events.len(), 2);
        assert_eq!(intro.events[0].id, "rocket_intro_narrate_0");

        let zip = intro.events[1].character.as_ref().unwrap();
        assert_eq!(zip.voice, Voice::Ash);
        assert_eq!(zip.prompt, "A cheerful rocket pilot");
    }

    #[test]
    fn image_paths_resolve_against_the_backend() {
        assert_eq!(
            resolve_image_url("http://localhost:8000", "images/1.png"),
            "http://localhost:8000/images/1.png"
        );
        assert_eq!(
            resolve_image_url("http://localhost:8000", "https://cdn.example.com/a.png"),
            "https://cdn.example.com/a.png"
        );
    }

    #[test]
    fn generate_request_body_shape() {
        let body = serde_json::to_value(GenerateRequest {
            child_name: "Xavier",
            child_age: 6,
            child_interests: "rockets and dinosaurs",
        })
        .unwrap();
        assert_eq!(body["child_name"], "Xavier");
        assert_eq!(body["child_age"], 6);
        assert_eq!(body["child_interests"], "rockets and dinosaurs");
    }
}
