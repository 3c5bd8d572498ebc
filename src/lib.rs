//! Home Security Calculator lead API library
//!
//! Risk scoring, external data gateways (income, crime, geocoding), HubSpot
//! lead sync, payment-webhook fulfillment and deliverable delivery, exposed
//! over one axum router.
//!
//! # Modules
//!
//! - `api`: HTTP-facing handlers and the router.
//! - `core`: Scoring, intake normalisation, delivery and fulfillment logic.
//! - `integrations`: HubSpot, SendGrid and data-provider clients.
//! - `cache`: TTL cache and injectable clock.
//! - `circuit_breaker`: Upstream circuit breaker.
//! - `config`: Configuration management.
//! - `crm_client`: HubSpot CRM, Files and Forms client.
//! - `delivery`: Delivery tokens and links.
//! - `errors`: Error handling types.
//! - `fulfillment`: Payment-driven deal state transitions.
//! - `handlers`: Application state, data and delivery handlers.
//! - `intake`: Lead field normalisation.
//! - `lead_handler`: Form submission, CRM sync and deliverable upload handlers.
//! - `mailer`: SendGrid email.
//! - `models`: Request/response DTOs and the listing status.
//! - `properties`: Canonical contact fields and their CRM property names.
//! - `routes`: Router construction.
//! - `scoring`: Risk and monetization model.
//! - `services`: Income, crime and geocoding gateways.
//! - `signature`: HubSpot webhook signature verification.
//! - `webhook_handler`: Payment webhook handler.
//! - `webhook_models`: Webhook payload and outcome models.

pub mod api;
pub mod core;
pub mod integrations;

pub mod cache;
pub mod circuit_breaker;
pub mod config;
pub mod crm_client;
pub mod delivery;
pub mod errors;
pub mod fulfillment;
pub mod handlers;
pub mod intake;
pub mod lead_handler;
pub mod mailer;
pub mod models;
pub mod properties;
pub mod routes;
pub mod scoring;
pub mod services;
pub mod signature;
pub mod webhook_handler;
pub mod webhook_models;
